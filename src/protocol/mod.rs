//! Wire protocols spoken by the gateway

pub mod mysql;
pub mod postgres;

use serde::{Deserialize, Serialize};

/// Database protocol served by a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseProtocol {
    MySql,
    Postgres,
}

impl DatabaseProtocol {
    /// Prompt prepended to replayed commands
    pub fn prompt(&self) -> &'static str {
        match self {
            DatabaseProtocol::MySql => "mysql>",
            DatabaseProtocol::Postgres => "",
        }
    }
}

impl std::fmt::Display for DatabaseProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseProtocol::MySql => write!(f, "mysql"),
            DatabaseProtocol::Postgres => write!(f, "postgresql"),
        }
    }
}
