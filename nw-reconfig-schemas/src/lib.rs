pub mod cli_models;
pub mod inventory;
pub mod payload;
pub mod settings;

pub const NW_RECONFIG_SETTINGS_FOLDER: &str = "/var/lib/nw-reconfig/";
