//! Registry of the server-owned collections mirrored locally.
//!
//! Each collection tag maps to exactly one SQLite mirror table and one REST
//! path on the POS server, so dispatch never builds table names or URLs from
//! caller-supplied strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Categories,
    Products,
    Services,
    Customers,
    Employees,
    Inventory,
}

impl Collection {
    /// Every mirrored collection, in the order the snapshot refresh writes them.
    pub const ALL: [Collection; 6] = [
        Collection::Categories,
        Collection::Products,
        Collection::Services,
        Collection::Customers,
        Collection::Employees,
        Collection::Inventory,
    ];

    /// Wire / storage name. Also the key in the `/pos/sync` payload.
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Categories => "categories",
            Collection::Products => "products",
            Collection::Services => "services",
            Collection::Customers => "customers",
            Collection::Employees => "employees",
            Collection::Inventory => "inventory",
        }
    }

    /// Local mirror table.
    pub fn table(self) -> &'static str {
        // Table names match the wire names one-to-one.
        self.as_str()
    }

    /// REST collection root on the POS server.
    pub fn rest_path(self) -> &'static str {
        match self {
            Collection::Categories => "/categories",
            Collection::Products => "/products",
            Collection::Services => "/services",
            Collection::Customers => "/customers",
            Collection::Employees => "/employees",
            Collection::Inventory => "/inventory",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| CoreError::UnknownCollection(s.to_string()))
    }
}
