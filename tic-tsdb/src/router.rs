use crate::error::WriteError;
use crate::types::{MeasurementKind, TelemetryEvent};
use crate::upsert::{parse_value, CurrentSample, EnergyReading, PowerSample, Upsert};

/// Pick the table an event belongs to and build the row to write.
///
/// Fails only when the value is not an integer; there is no unroutable field,
/// the `Field` table is closed.
pub fn classify(event: &TelemetryEvent) -> Result<Upsert, WriteError> {
    let field = event.field.as_str();
    let value = parse_value(field, &event.raw_value)?;

    let upsert = match event.field.kind() {
        MeasurementKind::Current { phase } => Upsert::Current(CurrentSample {
            timestamp: event.timestamp,
            phase,
            current: value,
        }),
        MeasurementKind::Power => Upsert::Power(PowerSample {
            timestamp: event.timestamp,
            power: value,
        }),
        MeasurementKind::Energy { tariff } => Upsert::Energy(EnergyReading {
            timestamp: event.timestamp,
            tariff,
            reading: value,
        }),
    };

    Ok(upsert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Field;
    use chrono::{DateTime, Utc};

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1650000000, 0).unwrap()
    }

    fn event(field: Field, value: &str) -> TelemetryEvent {
        TelemetryEvent {
            timestamp: ts(),
            field,
            raw_value: value.to_owned(),
        }
    }

    #[test]
    fn current_carries_the_phase() {
        assert_eq!(
            classify(&event(Field::Iinst2, "5")).unwrap(),
            Upsert::Current(CurrentSample {
                timestamp: ts(),
                phase: 2,
                current: 5
            })
        );
        assert_eq!(
            classify(&event(Field::Iinst, "12")).unwrap(),
            Upsert::Current(CurrentSample {
                timestamp: ts(),
                phase: 0,
                current: 12
            })
        );
    }

    #[test]
    fn power() {
        assert_eq!(
            classify(&event(Field::Papp, "350")).unwrap(),
            Upsert::Power(PowerSample {
                timestamp: ts(),
                power: 350
            })
        );
    }

    #[test]
    fn energy_uses_the_label_as_tariff() {
        assert_eq!(
            classify(&event(Field::Hchp, "12345")).unwrap(),
            Upsert::Energy(EnergyReading {
                timestamp: ts(),
                tariff: "HCHP",
                reading: 12345
            })
        );
    }

    #[test]
    fn every_field_routes_to_exactly_one_table() {
        for field in Field::ALL {
            let table = classify(&event(field, "1")).unwrap().table();
            let expected = match field {
                Field::Iinst | Field::Iinst1 | Field::Iinst2 | Field::Iinst3 => "current",
                Field::Papp => "power",
                Field::Base | Field::Hchp | Field::Hchc => "energy",
            };
            assert_eq!(table, expected, "{field}");
        }
    }

    #[test]
    fn invalid_value_is_an_error() {
        assert!(matches!(
            classify(&event(Field::Papp, "n/a")),
            Err(WriteError::ParseValue { field: "PAPP", .. })
        ));
    }
}
