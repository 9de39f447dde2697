use std::{path::Path, sync::Arc};

use anyhow::{Context, bail};
use config::{Config, Environment, File};
use serde::Deserialize;
use volley::{
    Aggregator, InstancePool, Metrics, NewGun, Pool, Provider,
    aggregator::{
        DiscardAggregator, EncoderAggregatorConfig, JsonLinesAggregator, JsonLinesEncoder,
        PhoutAggregator, PhoutEncoder,
    },
    ammo::JsonAmmo,
    gun::{EchoGun, EchoGunConfig},
    provider::{DecodeProviderConfig, NumProvider, NumProviderConfig, json_line_provider},
    schedule::ScheduleSpec,
};

/// Directories searched for `load.{yaml,json,toml,...}` when no config path is given.
pub const SEARCH_DIRS: [&str; 3] = [".", "./config", "/etc/volley"];

pub const EXAMPLE: &str = r#"pools:
  - id: echo
    gun:
      type: echo
      tag: echo
      delay: 2ms
    provider:
      type: num
      limit: 100000
    aggregator:
      type: phout
      id: true
      sink:
        type: file
        path: ./phout.log
      flush-interval: 1s
    rps:
      - {type: line, from: 1, to: 500, duration: 30s}
      - {type: const, ops: 500, duration: 1m}
    startup: {type: instance_step, from: 10, to: 100, step: 10, step-duration: 2s}
    discard-overflow: true
"#;

#[derive(Debug, Deserialize)]
pub struct CliConfig {
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolConfig {
    #[serde(default)]
    pub id: String,
    pub provider: ProviderConfig,
    pub aggregator: AggregatorConfig,
    pub gun: GunConfig,
    pub rps: ScheduleSpec,
    pub startup: ScheduleSpec,
    #[serde(default)]
    pub shared_schedule: bool,
    #[serde(default)]
    pub discard_overflow: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    Num(NumProviderConfig),
    Jsonline(DecodeProviderConfig),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregatorConfig {
    Phout(PhoutConfig),
    Jsonlines(EncoderAggregatorConfig),
    Discard,
}

#[derive(Debug, Deserialize)]
pub struct PhoutConfig {
    #[serde(default)]
    pub id: bool,
    #[serde(flatten)]
    pub encoder: EncoderAggregatorConfig,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GunConfig {
    Echo(EchoGunConfig),
}

impl PoolConfig {
    pub fn build(self, index: usize, metrics: &Metrics) -> anyhow::Result<Arc<dyn Pool>> {
        let id = if self.id.is_empty() {
            format!("pool_{index}")
        } else {
            self.id
        };
        // Surface schedule errors now rather than when the pool starts.
        self.rps
            .build()
            .with_context(|| format!("pool {id}: invalid rps schedule"))?;
        self.startup
            .build()
            .with_context(|| format!("pool {id}: invalid startup schedule"))?;

        let provider: Arc<dyn Provider<JsonAmmo>> = match self.provider {
            ProviderConfig::Num(config) => Arc::new(NumProvider::new(config)),
            ProviderConfig::Jsonline(config) => Arc::new(json_line_provider::<JsonAmmo>(config)),
        };
        let aggregator: Arc<dyn Aggregator> = match self.aggregator {
            AggregatorConfig::Phout(config) => Arc::new(PhoutAggregator::new(
                config.encoder,
                PhoutEncoder { id: config.id },
            )),
            AggregatorConfig::Jsonlines(config) => {
                Arc::new(JsonLinesAggregator::new(config, JsonLinesEncoder))
            }
            AggregatorConfig::Discard => Arc::new(DiscardAggregator),
        };
        let new_gun: NewGun<JsonAmmo> = match self.gun {
            GunConfig::Echo(config) => EchoGun::factory(config),
        };

        let pool = InstancePool::<JsonAmmo>::builder()
            .id(id)
            .provider(provider)
            .aggregator(aggregator)
            .new_gun(new_gun)
            .new_rps_schedule(self.rps.factory())
            .new_startup_schedule(self.startup.factory())
            .shared_schedule(self.shared_schedule)
            .discard_overflow(self.discard_overflow)
            .metrics(metrics.clone())
            .build();
        Ok(Arc::new(pool))
    }
}

/// Loads the config from `path`, or from the first `load.*` found in
/// [`SEARCH_DIRS`]. `VOLLEY__...` environment variables override file values.
pub fn load(path: Option<&Path>) -> anyhow::Result<CliConfig> {
    let mut builder = Config::builder();
    match path {
        Some(path) => builder = builder.add_source(File::from(path)),
        None => {
            for dir in SEARCH_DIRS.iter().rev() {
                builder = builder.add_source(File::with_name(&format!("{dir}/load")).required(false));
            }
        }
    }
    builder = builder.add_source(
        Environment::with_prefix("VOLLEY")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config: CliConfig = builder
        .build()
        .and_then(|config| config.try_deserialize())
        .with_context(|| match path {
            Some(path) => format!("failed to load config {}", path.display()),
            None => format!("failed to load config load.* from {}", SEARCH_DIRS.join(", ")),
        })?;
    if config.pools.is_empty() {
        bail!("config defines no pools");
    }
    Ok(config)
}
