use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres};

use crate::error::WriteError;
use crate::metrics::UPSERTS_ISSUED;

// All three writes are last-write-wins on the natural key, so re-delivered
// or corrected readings overwrite and never duplicate.

const UPSERT_CURRENT: &str = r#"
    INSERT INTO current ("timestamp", phase, current) VALUES ($1, $2, $3)
    ON CONFLICT ("timestamp", phase) DO UPDATE
    SET current = excluded.current"#;

const UPSERT_POWER: &str = r#"
    INSERT INTO power ("timestamp", power) VALUES ($1, $2)
    ON CONFLICT ("timestamp") DO UPDATE
    SET power = excluded.power"#;

const UPSERT_ENERGY: &str = r#"
    INSERT INTO energy ("timestamp", tariff, reading) VALUES ($1, $2, $3)
    ON CONFLICT ("timestamp", tariff) DO UPDATE
    SET reading = excluded.reading"#;

/// Parse a TIC value. Meters pad with leading zeros, which `i32::from_str` accepts.
pub fn parse_value(field: &'static str, raw: &str) -> Result<i32, WriteError> {
    raw.parse::<i32>().map_err(|error| WriteError::ParseValue {
        field,
        value: raw.to_owned(),
        error,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentSample {
    pub timestamp: DateTime<Utc>,
    pub phase: i16,
    pub current: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerSample {
    pub timestamp: DateTime<Utc>,
    pub power: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnergyReading {
    pub timestamp: DateTime<Utc>,
    pub tariff: &'static str,
    pub reading: i32,
}

/// One row to write, in the table matching its measurement kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Current(CurrentSample),
    Power(PowerSample),
    Energy(EnergyReading),
}

impl CurrentSample {
    pub async fn issue<'c, E>(&self, executor: E) -> Result<(), WriteError>
    where
        E: Executor<'c, Database = Postgres>,
    {
        sqlx::query(UPSERT_CURRENT)
            .bind(self.timestamp)
            .bind(self.phase)
            .bind(self.current)
            .execute(executor)
            .await
            .map_err(|error| WriteError::Query {
                table: "current",
                error,
            })?;

        metrics::counter!(UPSERTS_ISSUED, &[("table", "current")]).increment(1);
        Ok(())
    }
}

impl PowerSample {
    pub async fn issue<'c, E>(&self, executor: E) -> Result<(), WriteError>
    where
        E: Executor<'c, Database = Postgres>,
    {
        sqlx::query(UPSERT_POWER)
            .bind(self.timestamp)
            .bind(self.power)
            .execute(executor)
            .await
            .map_err(|error| WriteError::Query {
                table: "power",
                error,
            })?;

        metrics::counter!(UPSERTS_ISSUED, &[("table", "power")]).increment(1);
        Ok(())
    }
}

impl EnergyReading {
    pub async fn issue<'c, E>(&self, executor: E) -> Result<(), WriteError>
    where
        E: Executor<'c, Database = Postgres>,
    {
        sqlx::query(UPSERT_ENERGY)
            .bind(self.timestamp)
            .bind(self.tariff)
            .bind(self.reading)
            .execute(executor)
            .await
            .map_err(|error| WriteError::Query {
                table: "energy",
                error,
            })?;

        metrics::counter!(UPSERTS_ISSUED, &[("table", "energy")]).increment(1);
        Ok(())
    }
}

impl Upsert {
    pub fn table(&self) -> &'static str {
        match self {
            Upsert::Current(_) => "current",
            Upsert::Power(_) => "power",
            Upsert::Energy(_) => "energy",
        }
    }

    pub async fn issue<'c, E>(&self, executor: E) -> Result<(), WriteError>
    where
        E: Executor<'c, Database = Postgres>,
    {
        match self {
            Upsert::Current(sample) => sample.issue(executor).await,
            Upsert::Power(sample) => sample.issue(executor).await,
            Upsert::Energy(reading) => reading.issue(executor).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_base_ten_integers() {
        assert_eq!(parse_value("PAPP", "350").unwrap(), 350);
        assert_eq!(parse_value("HCHP", "012345678").unwrap(), 12345678);
        assert_eq!(parse_value("IINST", "-1").unwrap(), -1);
    }

    #[test]
    fn rejects_everything_else() {
        for raw in ["", "3.5", "0x10", "12a", " 5", "2147483648"] {
            match parse_value("PAPP", raw) {
                Err(WriteError::ParseValue { field, value, .. }) => {
                    assert_eq!(field, "PAPP");
                    assert_eq!(value, raw);
                }
                other => panic!("{raw:?} unexpectedly gave {other:?}"),
            }
        }
    }
}
