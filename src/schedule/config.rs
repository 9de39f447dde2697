use std::{sync::Arc, time::Duration};

use serde::Deserialize;

use super::{NewSchedule, Schedule};
use crate::error::Result;

/// One schedule plan as written in a config file.
///
/// ```yaml
/// rps:
///   - {type: line, from: 1, to: 100, duration: 30s}
///   - {type: const, ops: 100, duration: 1m}
/// startup: {type: instance_step, from: 10, to: 100, step: 10, step-duration: 5s}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Once {
        times: i64,
    },
    #[serde(rename = "const")]
    Const {
        ops: f64,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    Line {
        from: f64,
        to: f64,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    Step {
        from: f64,
        to: f64,
        step: f64,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    InstanceStep {
        from: i64,
        to: i64,
        step: i64,
        #[serde(rename = "step-duration", alias = "step_duration", with = "humantime_serde")]
        step_duration: Duration,
    },
    Unlimited {
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    Composite {
        nested: Vec<ScheduleConfig>,
    },
}

impl ScheduleConfig {
    pub fn build(&self) -> Result<Box<dyn Schedule>> {
        Ok(match self {
            ScheduleConfig::Once { times } => Box::new(super::once(*times)),
            ScheduleConfig::Const { ops, duration } => Box::new(super::constant(*ops, *duration)),
            ScheduleConfig::Line { from, to, duration } => {
                Box::new(super::line(*from, *to, *duration))
            }
            ScheduleConfig::Step {
                from,
                to,
                step,
                duration,
            } => Box::new(super::step(*from, *to, *step, *duration)?),
            ScheduleConfig::InstanceStep {
                from,
                to,
                step,
                step_duration,
            } => Box::new(super::instance_step(*from, *to, *step, *step_duration)?),
            ScheduleConfig::Unlimited { duration } => Box::new(super::unlimited(*duration)),
            ScheduleConfig::Composite { nested } => Box::new(super::composite(
                nested.iter().map(ScheduleConfig::build).collect::<Result<_>>()?,
            )),
        })
    }
}

/// A single plan, or a list of plans run one after another.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScheduleSpec {
    One(ScheduleConfig),
    Many(Vec<ScheduleConfig>),
}

impl ScheduleSpec {
    pub fn build(&self) -> Result<Box<dyn Schedule>> {
        match self {
            ScheduleSpec::One(config) => config.build(),
            ScheduleSpec::Many(configs) => Ok(Box::new(super::composite(
                configs.iter().map(ScheduleConfig::build).collect::<Result<_>>()?,
            ))),
        }
    }

    /// Factory producing a fresh, unstarted schedule on every call.
    pub fn factory(self) -> NewSchedule {
        Arc::new(move || self.build().map(Arc::<dyn Schedule>::from))
    }
}

impl From<ScheduleConfig> for ScheduleSpec {
    fn from(config: ScheduleConfig) -> Self {
        ScheduleSpec::One(config)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_every_kind() {
        let spec: ScheduleSpec = serde_json::from_value(json!([
            {"type": "once", "times": 2},
            {"type": "const", "ops": 10, "duration": "1s"},
            {"type": "line", "from": 0, "to": 10, "duration": "2s"},
            {"type": "step", "from": 1, "to": 3, "step": 1, "duration": "500ms"},
            {"type": "instance_step", "from": 1, "to": 3, "step": 1, "step-duration": "1m"},
            {"type": "unlimited", "duration": "1h"},
            {"type": "composite", "nested": [{"type": "once", "times": 1}]},
        ]))
        .unwrap();
        let ScheduleSpec::Many(configs) = &spec else {
            panic!("expected a list");
        };
        assert_eq!(configs.len(), 7);
        assert_eq!(
            configs[1],
            ScheduleConfig::Const {
                ops: 10.0,
                duration: Duration::from_secs(1)
            }
        );
        // The unlimited member makes the total unknown.
        assert_eq!(spec.build().unwrap().left(), -1);
    }

    #[test]
    fn single_plan_builds_plain_schedule() {
        let spec: ScheduleSpec =
            serde_json::from_value(json!({"type": "const", "ops": 10, "duration": "2s"})).unwrap();
        assert_eq!(spec.build().unwrap().left(), 20);
    }

    #[test]
    fn factory_builds_independent_schedules() {
        let factory = ScheduleSpec::from(ScheduleConfig::Once { times: 3 }).factory();
        let first = factory().unwrap();
        while first.next().is_shot() {}
        assert_eq!(first.left(), 0);
        assert_eq!(factory().unwrap().left(), 3);
    }

    #[test]
    fn invalid_step_is_a_config_error() {
        let config = ScheduleConfig::Step {
            from: 1.0,
            to: 5.0,
            step: 0.0,
            duration: Duration::from_secs(1),
        };
        assert!(matches!(config.build(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let res = serde_json::from_value::<ScheduleConfig>(json!({"type": "sine"}));
        assert!(res.is_err());
    }
}
