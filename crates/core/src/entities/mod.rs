//! Mirrored entity kinds, external payload shapes and the entity mapper.

mod external;
mod mapper;
mod row;

pub use external::*;
pub use mapper::*;
pub use row::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// Resource kinds mirrored from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Store,
    Brand,
    Category,
    Product,
    Customer,
    Order,
    OrderItem,
    Shipment,
    Coupon,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::Store,
        EntityKind::Brand,
        EntityKind::Category,
        EntityKind::Product,
        EntityKind::Customer,
        EntityKind::Order,
        EntityKind::OrderItem,
        EntityKind::Shipment,
        EntityKind::Coupon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Brand => "brand",
            Self::Category => "category",
            Self::Product => "product",
            Self::Customer => "customer",
            Self::Order => "order",
            Self::OrderItem => "order_item",
            Self::Shipment => "shipment",
            Self::Coupon => "coupon",
        }
    }

    /// Resolves the leading segment of a webhook event name (`order.created`).
    pub fn from_event_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "store" => Some(Self::Store),
            "brand" => Some(Self::Brand),
            "category" => Some(Self::Category),
            "product" => Some(Self::Product),
            "customer" => Some(Self::Customer),
            "order" => Some(Self::Order),
            "shipment" => Some(Self::Shipment),
            "coupon" => Some(Self::Coupon),
            _ => None,
        }
    }

    /// Whether the platform exposes a listing endpoint for this kind.
    /// Order items only arrive embedded in orders.
    pub fn is_listable(&self) -> bool {
        !matches!(self, Self::OrderItem)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| Error::InvalidInput(format!("unknown entity kind '{}'", value)))
    }
}

/// Natural key of a mirrored entity. At most one row exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub store_id: String,
    pub kind: EntityKind,
    pub external_id: String,
}

impl EntityKey {
    pub fn new(store_id: impl Into<String>, kind: EntityKind, external_id: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            kind,
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.store_id, self.kind, self.external_id)
    }
}
