mod settings;

pub use settings::{
    ApnsChannelSettings, ChannelSettings, FcmChannelSettings, ServiceSettings, Settings,
};
