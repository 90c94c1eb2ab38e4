//! Database entities.
//!
//! We use SeaORM and target PostgreSQL (production) and SQLite (development).

pub mod batch_tracker;
pub mod configuration;
pub mod export;
pub mod export_batch;
pub mod export_upload;
pub mod failure;
pub mod import_entity;
pub mod import_job;
pub mod portable_route;
pub mod tracker;

use std::fmt::Display;

use sea_orm::entity::Value;
use sea_orm::sea_query::{ArrayType, ColumnType, ValueType, ValueTypeErr};
use sea_orm::{DbErr, QueryResult, TryGetError, TryGetable};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A value that is stored in the database as JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Json<T>(pub T);

/// A status that is stored in the database as its integer code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Status<S>(pub S);

impl<T: Serialize + DeserializeOwned> From<Json<T>> for Value {
    fn from(value: Json<T>) -> Self {
        let opt = serde_json::to_string(&value).ok().map(Box::new);

        Value::String(opt)
    }
}

impl<T: Serialize + DeserializeOwned> TryGetable for Json<T> {
    fn try_get_by<I: sea_orm::ColIdx>(res: &QueryResult, idx: I) -> Result<Self, TryGetError> {
        let json_str: String = res.try_get_by(idx).map_err(TryGetError::DbErr)?;

        serde_json::from_str(&json_str).map_err(|e| TryGetError::DbErr(DbErr::Json(e.to_string())))
    }
}

impl<T: Serialize + DeserializeOwned> ValueType for Json<T> {
    fn try_from(v: Value) -> Result<Self, ValueTypeErr> {
        match v {
            Value::String(Some(x)) => Ok(Json(serde_json::from_str(&x).map_err(|_| ValueTypeErr)?)),
            _ => Err(ValueTypeErr),
        }
    }

    fn type_name() -> String {
        stringify!(Json<T>).to_owned()
    }

    fn column_type() -> ColumnType {
        ColumnType::String(None)
    }

    fn array_type() -> ArrayType {
        ArrayType::String
    }
}

impl<S> From<Status<S>> for Value
where
    S: Into<i16>,
{
    fn from(value: Status<S>) -> Self {
        Value::SmallInt(Some(value.0.into()))
    }
}

impl<S> TryGetable for Status<S>
where
    S: TryFrom<i16>,
    S::Error: Display,
{
    fn try_get_by<I: sea_orm::ColIdx>(res: &QueryResult, idx: I) -> Result<Self, TryGetError> {
        let code: i16 = res.try_get_by(idx).map_err(TryGetError::DbErr)?;

        S::try_from(code)
            .map(Status)
            .map_err(|e| TryGetError::DbErr(DbErr::Type(e.to_string())))
    }
}

impl<S> ValueType for Status<S>
where
    S: TryFrom<i16>,
{
    fn try_from(v: Value) -> Result<Self, ValueTypeErr> {
        match v {
            Value::SmallInt(Some(code)) => S::try_from(code).map(Status).map_err(|_| ValueTypeErr),
            _ => Err(ValueTypeErr),
        }
    }

    fn type_name() -> String {
        stringify!(Status<S>).to_owned()
    }

    fn column_type() -> ColumnType {
        ColumnType::SmallInteger
    }

    fn array_type() -> ArrayType {
        ArrayType::SmallInt
    }
}
