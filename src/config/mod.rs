//! Configuration loading
//!
//! Sources, lowest precedence first:
//! - built-in defaults (`Settings::default()`)
//! - optional `config/default.{toml,yaml,json,...}` relative to the working directory
//! - environment variables prefixed `NT4`, sections split by `__`
//!   (`NT4__SERVER__PORT=5811`)

mod settings;

use config::{Config, Environment, File};

pub use settings::{ClientSettings, LogSettings, ServerSettings, Settings};

use crate::config::settings::PartialSettings;
use crate::utils::error::Result;

pub fn load_config() -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("NT4")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_over(Settings::default()))
}
