//! Pure translation from platform payloads to internal rows.
//!
//! Flattening rules, fixed per kind so repeated mapping of the same payload
//! yields the same row:
//!
//! | kind       | amounts                                    | nested data                                         | parents            |
//! |------------|--------------------------------------------|-----------------------------------------------------|--------------------|
//! | store      | -                                          | -                                                   | -                  |
//! | brand      | -                                          | -                                                   | -                  |
//! | category   | -                                          | -                                                   | `parent_id`        |
//! | product    | `price`, `sale_price`, `regular_price`     | `category_external_ids` ids, `images`/`options`/`variants` JSON arrays | `brand_id` |
//! | customer   | -                                          | -                                                   | -                  |
//! | order      | `total`, `sub_total`, `shipping_cost`, `discount` | `item_external_ids` ids, `shipping_*` address columns | `customer_id` |
//! | order_item | `unit_price`, `total`                      | `options` JSON                                      | `order_id`         |
//! | shipment   | `shipping_cost`                            | `ship_to_*` address columns                         | `order_id`         |
//! | coupon     | `amount`                                   | -                                                   | -                  |
//!
//! Amount columns hold the decimal as text; the row's single `currency` column
//! holds the currency shared by its amounts. `metadata` is passed through untouched.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::external::*;
use super::{EntityKey, EntityKind, MappedChange, MappedRow, ParentRef};
use crate::errors::MappingError;
use crate::sync::{ChangeEvent, ChangeOp};

type MapResult<T> = std::result::Result<T, MappingError>;

/// Maps one payload of `kind` to the row that mirrors it.
pub fn map_to_internal(kind: EntityKind, store_id: &str, payload: &Value) -> MapResult<MappedRow> {
    let entity = ExternalEntity::decode(kind, payload)?;
    Ok(flatten(store_id, entity))
}

/// Maps a change event to the storage change it implies.
pub fn map_change(event: &ChangeEvent) -> MapResult<MappedChange> {
    let declared_id = PayloadReader::root(event.kind, &event.payload)?.opt_id("id")?;
    if let Some(id) = declared_id.as_deref() {
        if id != event.external_id {
            return Err(MappingError::new(
                event.kind,
                "id",
                format!("payload id '{}' does not match event id '{}'", id, event.external_id),
            ));
        }
    }

    match event.op {
        ChangeOp::Upsert => {
            let row = map_to_internal(event.kind, &event.store_id, &event.payload)?;
            Ok(MappedChange::Upsert(row))
        }
        ChangeOp::Delete => {
            let updated_at = PayloadReader::root(event.kind, &event.payload)?
                .opt_datetime("updated_at")
                .unwrap_or(None);
            Ok(MappedChange::Delete {
                key: EntityKey::new(event.store_id.clone(), event.kind, event.external_id.clone()),
                updated_at,
            })
        }
    }
}

/// Order payloads embed their items; each becomes its own change event.
///
/// Items inherit the order's `updated_at` when they carry none, and get the
/// order's external id injected as `order_id`. Items without an id are left to
/// the order's own mapping, which rejects them.
pub fn derive_child_events(event: &ChangeEvent) -> Vec<ChangeEvent> {
    if event.kind != EntityKind::Order || event.op != ChangeOp::Upsert {
        return Vec::new();
    }
    let items = match event.payload.get("items").and_then(Value::as_array) {
        Some(items) => items,
        None => return Vec::new(),
    };
    let order_updated_at = event.payload.get("updated_at").cloned();

    items
        .iter()
        .filter_map(|item| {
            let object = item.as_object()?;
            let external_id = match object.get("id")? {
                Value::String(id) if !id.trim().is_empty() => id.trim().to_string(),
                Value::Number(id) if id.is_i64() || id.is_u64() => id.to_string(),
                _ => return None,
            };
            let mut payload: Map<String, Value> = object.clone();
            payload.insert("order_id".to_string(), Value::String(event.external_id.clone()));
            if !payload.get("updated_at").is_some_and(|v| !v.is_null()) {
                if let Some(updated_at) = order_updated_at.clone() {
                    payload.insert("updated_at".to_string(), updated_at);
                }
            }
            Some(ChangeEvent {
                source: event.source,
                kind: EntityKind::OrderItem,
                op: ChangeOp::Upsert,
                store_id: event.store_id.clone(),
                external_id,
                payload: Value::Object(payload),
                observed_at: event.observed_at,
                sequence_hint: event.sequence_hint,
            })
        })
        .collect()
}

fn flatten(store_id: &str, entity: ExternalEntity) -> MappedRow {
    let kind = entity.kind();
    let external_id = entity.external_id().to_string();
    let updated_at = entity.updated_at();
    let mut row = RowBuilder::default();

    match entity {
        ExternalEntity::Store(store) => {
            row.text("name", Some(store.name));
            row.text("email", store.email);
            row.text("domain", store.domain);
            row.text("currency", store.currency);
            row.text("plan", store.plan);
            row.text("status", store.status);
            row.json("metadata", store.metadata);
        }
        ExternalEntity::Brand(brand) => {
            row.text("name", Some(brand.name));
            row.text("logo_url", brand.logo_url);
            row.text("description", brand.description);
            row.json("metadata", brand.metadata);
        }
        ExternalEntity::Category(category) => {
            row.text("name", Some(category.name));
            row.text("status", category.status.map(|s| s.to_column()));
            row.int("sort_order", category.sort_order);
            row.text("image_url", category.image_url);
            row.json("metadata", category.metadata);
            row.parent("parent_id", EntityKind::Category, category.parent_id);
        }
        ExternalEntity::Product(product) => {
            row.text("name", Some(product.name));
            row.text("sku", product.sku);
            row.amounts(&[
                ("price", Some(product.price)),
                ("sale_price", product.sale_price),
                ("regular_price", product.regular_price),
            ]);
            row.int("quantity", product.quantity);
            row.bool("unlimited_quantity", product.unlimited_quantity);
            row.text("status", Some(product.status.to_column()));
            row.text("product_type", product.product_type.map(|t| t.to_column()));
            row.ids("category_external_ids", product.category_ids);
            row.json(
                "images",
                Some(Value::Array(
                    product
                        .images
                        .into_iter()
                        .map(|image| json!({ "id": image.id, "url": image.url, "main": image.main }))
                        .collect(),
                )),
            );
            row.json(
                "options",
                Some(Value::Array(product.options.into_iter().map(option_json).collect())),
            );
            row.json(
                "variants",
                Some(Value::Array(
                    product
                        .variants
                        .into_iter()
                        .map(|variant| {
                            json!({
                                "id": variant.id,
                                "sku": variant.sku,
                                "price": variant.price.map(|p| p.amount.to_string()),
                                "stock_quantity": variant.stock_quantity,
                            })
                        })
                        .collect(),
                )),
            );
            row.json("metadata", product.metadata);
            row.parent("brand_id", EntityKind::Brand, product.brand_id);
        }
        ExternalEntity::Customer(customer) => {
            row.text("first_name", Some(customer.first_name));
            row.text("last_name", customer.last_name);
            row.text("email", customer.email);
            row.text("mobile", customer.mobile);
            row.text("mobile_code", customer.mobile_code);
            row.text("gender", customer.gender.map(|g| g.to_column()));
            row.text("city", customer.city);
            row.text("country", customer.country);
            row.json("metadata", customer.metadata);
        }
        ExternalEntity::Order(order) => {
            row.text("reference_id", Some(order.reference_id));
            row.text("status", Some(order.status.to_column()));
            row.amounts(&[
                ("total", Some(order.total)),
                ("sub_total", order.sub_total),
                ("shipping_cost", order.shipping_cost),
                ("discount", order.discount),
            ]);
            row.text("payment_method", order.payment_method);
            row.ids("item_external_ids", order.item_ids);
            row.address("shipping", order.shipping_address);
            row.datetime("ordered_at", order.ordered_at);
            row.json("metadata", order.metadata);
            row.parent("customer_id", EntityKind::Customer, order.customer_id);
        }
        ExternalEntity::OrderItem(item) => {
            row.text("name", Some(item.name));
            row.text("sku", item.sku);
            row.text("product_external_id", item.product_id);
            row.int("quantity", Some(item.quantity));
            row.amounts(&[("unit_price", item.unit_price), ("total", Some(item.total))]);
            row.json("options", item.options);
            row.json("metadata", item.metadata);
            row.parent("order_id", EntityKind::Order, Some(item.order_id));
        }
        ExternalEntity::Shipment(shipment) => {
            row.text("courier_name", shipment.courier_name);
            row.text("tracking_number", shipment.tracking_number);
            row.text("tracking_link", shipment.tracking_link);
            row.text("status", Some(shipment.status.to_column()));
            row.amounts(&[("shipping_cost", shipment.shipping_cost)]);
            row.address("ship_to", shipment.ship_to);
            row.json("metadata", shipment.metadata);
            row.parent("order_id", EntityKind::Order, Some(shipment.order_id));
        }
        ExternalEntity::Coupon(coupon) => {
            row.text("code", Some(coupon.code));
            row.text("coupon_type", Some(coupon.coupon_type.to_column()));
            row.amounts(&[("amount", Some(coupon.amount))]);
            row.bool("free_shipping", coupon.free_shipping);
            row.text("status", Some(coupon.status.to_column()));
            row.datetime("expiry_date", coupon.expiry_date);
            row.int("usage_limit", coupon.usage_limit);
            row.json("metadata", coupon.metadata);
        }
    }
    row.datetime("external_updated_at", updated_at);

    MappedRow {
        kind,
        store_id: store_id.to_string(),
        external_id,
        columns: row.columns,
        parents: row.parents,
        updated_at,
    }
}

fn option_json(option: ProductOption) -> Value {
    json!({
        "id": option.id,
        "name": option.name,
        "values": option
            .values
            .into_iter()
            .map(|value| json!({
                "id": value.id,
                "name": value.name,
                "price": value.price.map(|p| p.amount.to_string()),
            }))
            .collect::<Vec<_>>(),
    })
}

#[derive(Default)]
struct RowBuilder {
    columns: BTreeMap<String, Value>,
    parents: Vec<ParentRef>,
}

impl RowBuilder {
    fn set(&mut self, name: &str, value: Value) {
        self.columns.insert(name.to_string(), value);
    }

    fn text(&mut self, name: &str, value: Option<String>) {
        self.set(name, value.map(Value::String).unwrap_or(Value::Null));
    }

    fn int(&mut self, name: &str, value: Option<i64>) {
        self.set(name, value.map(Value::from).unwrap_or(Value::Null));
    }

    fn bool(&mut self, name: &str, value: bool) {
        self.set(name, Value::Bool(value));
    }

    fn datetime(&mut self, name: &str, value: Option<DateTime<Utc>>) {
        self.text(name, value.map(format_timestamp));
    }

    fn json(&mut self, name: &str, value: Option<Value>) {
        self.set(name, value.unwrap_or(Value::Null));
    }

    fn ids(&mut self, name: &str, ids: Vec<String>) {
        self.set(name, Value::Array(ids.into_iter().map(Value::String).collect()));
    }

    /// Writes each amount as text plus one shared `currency` column.
    /// Currency agreement is checked when the payload is decoded.
    fn amounts(&mut self, amounts: &[(&str, Option<Money>)]) {
        let mut currency = None;
        for (name, money) in amounts {
            if currency.is_none() {
                currency = money.as_ref().and_then(|m| m.currency.clone());
            }
            self.text(name, money.as_ref().map(|m| m.amount.to_string()));
        }
        self.text("currency", currency);
    }

    fn address(&mut self, prefix: &str, address: Option<Address>) {
        let address = address.unwrap_or_default();
        self.text(&format!("{}_country", prefix), address.country);
        self.text(&format!("{}_city", prefix), address.city);
        self.text(&format!("{}_address_line", prefix), address.address_line);
        self.text(&format!("{}_postal_code", prefix), address.postal_code);
    }

    fn parent(&mut self, column: &'static str, kind: EntityKind, external_id: Option<String>) {
        if let Some(external_id) = external_id {
            self.parents.push(ParentRef {
                column,
                kind,
                external_id,
            });
        } else {
            self.set(column, Value::Null);
        }
    }
}

/// Storage timestamp format: RFC 3339, millisecond precision, `Z` suffix.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
