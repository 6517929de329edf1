use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::time::UnixEpoch;

/// The TIC labels we persist. Anything else published by the device is ignored.
///
/// This table is both the subscription allow-list and the routing table: a label
/// that parses into a `Field` always has a `MeasurementKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Instantaneous current, single-phase meter.
    Iinst,
    Iinst1,
    Iinst2,
    Iinst3,
    /// Apparent power.
    Papp,
    /// Energy index, base tariff.
    Base,
    /// Energy index, peak hours.
    Hchp,
    /// Energy index, off-peak hours.
    Hchc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    /// Phase 0 is a single-phase meter, 1 to 3 are the phases of a three-phase one.
    Current { phase: i16 },
    Power,
    Energy { tariff: &'static str },
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Iinst,
        Field::Iinst1,
        Field::Iinst2,
        Field::Iinst3,
        Field::Papp,
        Field::Base,
        Field::Hchp,
        Field::Hchc,
    ];

    /// The label as published in the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Iinst => "IINST",
            Field::Iinst1 => "IINST1",
            Field::Iinst2 => "IINST2",
            Field::Iinst3 => "IINST3",
            Field::Papp => "PAPP",
            Field::Base => "BASE",
            Field::Hchp => "HCHP",
            Field::Hchc => "HCHC",
        }
    }

    pub fn kind(&self) -> MeasurementKind {
        match self {
            Field::Iinst => MeasurementKind::Current { phase: 0 },
            Field::Iinst1 => MeasurementKind::Current { phase: 1 },
            Field::Iinst2 => MeasurementKind::Current { phase: 2 },
            Field::Iinst3 => MeasurementKind::Current { phase: 3 },
            Field::Papp => MeasurementKind::Power,
            Field::Base | Field::Hchp | Field::Hchc => MeasurementKind::Energy {
                tariff: self.as_str(),
            },
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownFieldError(pub String);

impl FromStr for Field {
    type Err = UnknownFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| UnknownFieldError(s.to_owned()))
    }
}

/// JSON body published by the device for every label.
#[derive(Debug, Deserialize)]
pub struct TicPayload {
    pub ts: UnixEpoch,
    pub val: String,
}

/// A decoded measurement, waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub field: Field,
    pub raw_value: String,
}

impl TelemetryEvent {
    pub fn new(field: Field, payload: TicPayload) -> Self {
        Self {
            timestamp: payload.ts.into_inner(),
            field,
            raw_value: payload.val,
        }
    }
}
