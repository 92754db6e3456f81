//! Raw device values to typed, scaled, quality-annotated data points.

use crate::error::TranslationError;
use crate::point::{DataPoint, PollCycle, Quality, ReadResult, Value};
use crate::profile::{DataKind, DeviceProfile, TagDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// What to hand the publisher for a tag whose read failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleMode {
    /// Publish the failure as BAD and leave a gap.
    #[default]
    Gap,
    /// Re-publish the last GOOD value as STALE while it is young enough.
    HoldLastValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StalenessPolicy {
    pub mode: StaleMode,
    pub threshold: Duration,
}

impl StalenessPolicy {
    pub const DEFAULT_POLL_MULTIPLE: u32 = 3;

    pub fn for_poll_interval(mode: StaleMode, poll_interval: Duration) -> Self {
        Self {
            mode,
            threshold: poll_interval * Self::DEFAULT_POLL_MULTIPLE,
        }
    }
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self::for_poll_interval(StaleMode::Gap, Duration::from_secs(1))
    }
}

#[derive(Debug, Clone)]
struct HeldValue {
    value: Value,
    timestamp_us: u64,
}

pub struct Translator {
    policy: StalenessPolicy,
    last_good: HashMap<String, HeldValue>,
}

impl Translator {
    pub fn new(policy: StalenessPolicy) -> Self {
        Self {
            policy,
            last_good: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &StalenessPolicy {
        &self.policy
    }

    pub fn translate(&mut self, read: &ReadResult, tag: &TagDescriptor) -> DataPoint {
        let raw = match (&read.raw_value, read.ok) {
            (Some(raw), true) => raw,
            _ => return self.failed_read(read, tag),
        };

        match convert(raw, tag) {
            Ok(value) => {
                self.last_good.insert(
                    tag.name.clone(),
                    HeldValue {
                        value: value.clone(),
                        timestamp_us: read.timestamp_us,
                    },
                );
                DataPoint {
                    tag_name: tag.name.clone(),
                    value: Some(value),
                    quality: Quality::Good,
                    timestamp_us: read.timestamp_us,
                    raw: None,
                    note: None,
                }
            }
            Err(err) => {
                log::debug!("translation failed: {err}");
                DataPoint {
                    tag_name: tag.name.clone(),
                    value: None,
                    quality: Quality::Bad,
                    timestamp_us: read.timestamp_us,
                    raw: Some(raw.clone()),
                    note: Some(err.to_string()),
                }
            }
        }
    }

    /// Translate a whole cycle, preserving profile order. Reads for tags the
    /// profile does not know are dropped.
    pub fn translate_cycle(&mut self, cycle: &PollCycle, profile: &DeviceProfile) -> Vec<DataPoint> {
        cycle
            .results
            .iter()
            .filter_map(|read| {
                let tag = profile.tag(&read.tag_name);
                if tag.is_none() {
                    log::warn!("read for unknown tag '{}' dropped", read.tag_name);
                }
                tag.map(|tag| self.translate(read, tag))
            })
            .collect()
    }

    fn failed_read(&self, read: &ReadResult, tag: &TagDescriptor) -> DataPoint {
        if self.policy.mode == StaleMode::HoldLastValue {
            if let Some(held) = self.last_good.get(&tag.name) {
                let age = Duration::from_micros(read.timestamp_us.saturating_sub(held.timestamp_us));
                if age < self.policy.threshold {
                    return DataPoint {
                        tag_name: tag.name.clone(),
                        value: Some(held.value.clone()),
                        quality: Quality::Stale,
                        timestamp_us: held.timestamp_us,
                        raw: None,
                        note: read.error_kind.map(|k| format!("read failed: {k:?}")),
                    };
                }
            }
        }
        DataPoint {
            tag_name: tag.name.clone(),
            value: None,
            quality: Quality::Bad,
            timestamp_us: read.timestamp_us,
            raw: None,
            note: Some(
                TranslationError::ReadFailed {
                    tag: tag.name.clone(),
                }
                .to_string(),
            ),
        }
    }
}

/// Apply the descriptor's kind, scaling and range to a raw value.
pub fn convert(raw: &Value, tag: &TagDescriptor) -> Result<Value, TranslationError> {
    let mismatch = || TranslationError::TypeMismatch {
        tag: tag.name.clone(),
        expected: tag.data_kind.as_str(),
        actual: raw.kind_name(),
    };

    match (tag.data_kind, raw) {
        (DataKind::Int, Value::Int(i)) if tag.is_identity_scaling() => {
            check_range(tag, *i as f64)?;
            Ok(Value::Int(*i))
        }
        (DataKind::Int, Value::Int(i)) => scale(tag, *i as f64).map(Value::Float),
        (DataKind::Float, Value::Float(f)) => scale(tag, *f).map(Value::Float),
        (DataKind::Float, Value::Int(i)) => scale(tag, *i as f64).map(Value::Float),
        (DataKind::Bool, Value::Bool(b)) => Ok(Value::Bool(*b)),
        (DataKind::String, Value::String(s)) => Ok(Value::String(s.clone())),
        (DataKind::Array, Value::Array(items)) => items
            .iter()
            .map(|item| scale(tag, *item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        _ => Err(mismatch()),
    }
}

fn scale(tag: &TagDescriptor, raw: f64) -> Result<f64, TranslationError> {
    let value = raw * tag.scale + tag.offset;
    if !value.is_finite() {
        return Err(TranslationError::NonFinite {
            tag: tag.name.clone(),
        });
    }
    check_range(tag, value)?;
    Ok(value)
}

fn check_range(tag: &TagDescriptor, value: f64) -> Result<(), TranslationError> {
    match tag.range {
        Some(range) if !range.contains(value) => Err(TranslationError::OutOfRange {
            tag: tag.name.clone(),
            value,
            min: range.min,
            max: range.max,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::ReadErrorKind;

    fn float_tag() -> TagDescriptor {
        TagDescriptor::new("conductivity", "AI1", DataKind::Float, "ns=2;s=Conductivity")
            .with_scaling(0.1, 0.0)
    }

    fn hold_policy() -> StalenessPolicy {
        StalenessPolicy::for_poll_interval(StaleMode::HoldLastValue, Duration::from_millis(100))
    }

    #[test]
    fn scales_raw_integer_into_float() {
        let mut translator = Translator::new(StalenessPolicy::default());
        let read = ReadResult::success("conductivity", Value::Int(250), 1_700_000_000_000_000);
        let point = translator.translate(&read, &float_tag());
        assert_eq!(point.quality, Quality::Good);
        assert_eq!(point.timestamp_us, 1_700_000_000_000_000);
        match point.value {
            Some(Value::Float(v)) => assert!((v - 25.0).abs() < 1e-9),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn out_of_range_is_bad_and_keeps_raw() {
        let tag = float_tag().with_range(0.0, 20.0);
        let mut translator = Translator::new(StalenessPolicy::default());
        let point = translator.translate(&ReadResult::success("conductivity", Value::Int(250), 1), &tag);
        assert_eq!(point.quality, Quality::Bad);
        assert_eq!(point.value, None);
        assert_eq!(point.raw, Some(Value::Int(250)));
    }

    #[test]
    fn type_mismatch_is_bad() {
        let tag = TagDescriptor::new("flag", "DI1", DataKind::Bool, "n");
        let mut translator = Translator::new(StalenessPolicy::default());
        let point = translator.translate(&ReadResult::success("flag", Value::Float(1.0), 1), &tag);
        assert_eq!(point.quality, Quality::Bad);
        assert!(point.note.unwrap().contains("declared BOOL"));
    }

    #[test]
    fn int_with_identity_scaling_stays_int() {
        let tag = TagDescriptor::new("count", "C1", DataKind::Int, "n");
        assert_eq!(convert(&Value::Int(7), &tag), Ok(Value::Int(7)));
        assert!(convert(&Value::Float(7.0), &tag).is_err());
    }

    #[test]
    fn array_scales_elementwise() {
        let tag = TagDescriptor::new("spectrum", "A1", DataKind::Array, "n").with_scaling(2.0, 1.0);
        assert_eq!(
            convert(&Value::Array(vec![1.0, 2.0]), &tag),
            Ok(Value::Array(vec![3.0, 5.0]))
        );
    }

    #[test]
    fn gap_policy_reports_bad_on_failure() {
        let mut translator = Translator::new(StalenessPolicy::default());
        translator.translate(&ReadResult::success("conductivity", Value::Int(10), 0), &float_tag());
        let failed = ReadResult::failure("conductivity", ReadErrorKind::Timeout, 10);
        let point = translator.translate(&failed, &float_tag());
        assert_eq!(point.quality, Quality::Bad);
        assert_eq!(point.value, None);
    }

    #[test]
    fn hold_policy_reports_stale_within_threshold() {
        let mut translator = Translator::new(hold_policy());
        translator.translate(&ReadResult::success("conductivity", Value::Int(10), 1_000), &float_tag());

        let fresh = ReadResult::failure("conductivity", ReadErrorKind::Protocol, 101_000);
        let point = translator.translate(&fresh, &float_tag());
        assert_eq!(point.quality, Quality::Stale);
        assert_eq!(point.value, Some(Value::Float(1.0)));
        assert_eq!(point.timestamp_us, 1_000);

        let old = ReadResult::failure("conductivity", ReadErrorKind::Protocol, 400_000);
        assert_eq!(translator.translate(&old, &float_tag()).quality, Quality::Bad);
    }

    #[test]
    fn held_value_expires_at_threshold() {
        let mut translator = Translator::new(hold_policy());
        translator.translate(&ReadResult::success("conductivity", Value::Int(10), 0), &float_tag());

        let just_before = ReadResult::failure("conductivity", ReadErrorKind::Timeout, 299_999);
        assert_eq!(translator.translate(&just_before, &float_tag()).quality, Quality::Stale);

        let at_threshold = ReadResult::failure("conductivity", ReadErrorKind::Timeout, 300_000);
        let point = translator.translate(&at_threshold, &float_tag());
        assert_eq!(point.quality, Quality::Bad);
        assert_eq!(point.value, None);
    }

    #[test]
    fn bad_translation_does_not_refresh_held_value() {
        let tag = float_tag().with_range(0.0, 5.0);
        let mut translator = Translator::new(hold_policy());
        translator.translate(&ReadResult::success("conductivity", Value::Int(10), 0), &tag);
        translator.translate(&ReadResult::success("conductivity", Value::Int(999), 50_000), &tag);
        let point = translator.translate(
            &ReadResult::failure("conductivity", ReadErrorKind::Timeout, 60_000),
            &tag,
        );
        assert_eq!(point.value, Some(Value::Float(1.0)));
        assert_eq!(point.timestamp_us, 0);
    }
}

#[cfg(test)]
mod proptest_translate {
    use super::*;
    use crate::point::ReadErrorKind;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn good_only_from_ok_reads(
            ok in any::<bool>(),
            raw in -1_000_000i64..1_000_000,
            hold in any::<bool>(),
        ) {
            let mode = if hold { StaleMode::HoldLastValue } else { StaleMode::Gap };
            let mut translator = Translator::new(StalenessPolicy::for_poll_interval(mode, Duration::from_secs(1)));
            let tag = TagDescriptor::new("t", "AI1", DataKind::Float, "n");
            translator.translate(&ReadResult::success("t", Value::Int(1), 0), &tag);
            let read = if ok {
                ReadResult::success("t", Value::Int(raw), 10)
            } else {
                ReadResult::failure("t", ReadErrorKind::Transport, 10)
            };
            let point = translator.translate(&read, &tag);
            prop_assert_eq!(point.quality == Quality::Good, ok);
        }
    }
}
