//! Typed shapes of the platform's entity payloads.
//!
//! Every kind decodes into a closed struct through [`PayloadReader`], which
//! reports the exact field path on failure. Enum-like fields keep values the
//! engine does not recognise as [`Slug::Unknown`] instead of dropping them.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use log::warn;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;

use super::EntityKind;
use crate::errors::MappingError;

/// Offset applied to naive platform timestamps (Asia/Riyadh, no DST).
pub const PLATFORM_UTC_OFFSET_SECS: i32 = 3 * 3600;

type MapResult<T> = std::result::Result<T, MappingError>;

/// Enumerations exposed by the platform as string slugs.
pub trait PlatformEnum: Sized + Copy {
    fn from_slug(slug: &str) -> Option<Self>;
    fn as_slug(&self) -> &'static str;
}

macro_rules! platform_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $slug:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl PlatformEnum for $name {
            fn from_slug(slug: &str) -> Option<Self> {
                match slug {
                    $($slug => Some(Self::$variant),)+
                    _ => None,
                }
            }

            fn as_slug(&self) -> &'static str {
                match self {
                    $(Self::$variant => $slug),+
                }
            }
        }
    };
}

platform_enum!(ProductStatus {
    Sale => "sale",
    Out => "out",
    Hidden => "hidden",
    Deleted => "deleted",
});

platform_enum!(ProductType {
    Product => "product",
    Service => "service",
    GroupProducts => "group_products",
    Codes => "codes",
    Digital => "digital",
    Food => "food",
    Donating => "donating",
    Booking => "booking",
});

platform_enum!(OrderStatus {
    PaymentPending => "payment_pending",
    UnderReview => "under_review",
    InProgress => "in_progress",
    Completed => "completed",
    Delivering => "delivering",
    Delivered => "delivered",
    Shipped => "shipped",
    Canceled => "canceled",
    Restoring => "restoring",
    Restored => "restored",
});

platform_enum!(ShipmentStatus {
    Created => "created",
    Pending => "pending",
    InProgress => "in_progress",
    Delivering => "delivering",
    Delivered => "delivered",
    Shipped => "shipped",
    Cancelled => "cancelled",
    Returned => "returned",
});

platform_enum!(CategoryStatus {
    Active => "active",
    Hidden => "hidden",
});

platform_enum!(Gender {
    Male => "male",
    Female => "female",
});

platform_enum!(CouponType {
    Percentage => "percentage",
    Fixed => "fixed",
});

platform_enum!(CouponStatus {
    Active => "active",
    Inactive => "inactive",
});

/// A platform enum value, or the raw slug when the value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slug<T> {
    Known(T),
    Unknown(String),
}

impl<T: PlatformEnum> Slug<T> {
    pub fn parse(raw: &str) -> Self {
        match T::from_slug(raw) {
            Some(value) => Self::Known(value),
            None => Self::Unknown(raw.to_string()),
        }
    }

    /// Column representation: the slug, or `unknown:<raw>`.
    pub fn to_column(&self) -> String {
        match self {
            Self::Known(value) => value.as_slug().to_string(),
            Self::Unknown(raw) => format!("unknown:{}", raw),
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

/// A `{amount, currency}` pair, or a bare amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub country: Option<String>,
    pub city: Option<String>,
    pub address_line: Option<String>,
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalStore {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub domain: Option<String>,
    pub currency: Option<String>,
    pub plan: Option<String>,
    pub status: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalBrand {
    pub id: String,
    pub name: String,
    pub logo_url: Option<String>,
    pub description: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCategory {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub status: Option<Slug<CategoryStatus>>,
    pub sort_order: Option<i64>,
    pub image_url: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductImage {
    pub id: Option<String>,
    pub url: String,
    pub main: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductOptionValue {
    pub id: Option<String>,
    pub name: String,
    pub price: Option<Money>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductOption {
    pub id: Option<String>,
    pub name: String,
    pub values: Vec<ProductOptionValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductVariant {
    pub id: String,
    pub sku: Option<String>,
    pub price: Option<Money>,
    pub stock_quantity: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalProduct {
    pub id: String,
    pub name: String,
    pub sku: Option<String>,
    pub price: Money,
    pub sale_price: Option<Money>,
    pub regular_price: Option<Money>,
    pub quantity: Option<i64>,
    pub unlimited_quantity: bool,
    pub status: Slug<ProductStatus>,
    pub product_type: Option<Slug<ProductType>>,
    pub brand_id: Option<String>,
    pub category_ids: Vec<String>,
    pub images: Vec<ProductImage>,
    pub options: Vec<ProductOption>,
    pub variants: Vec<ProductVariant>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCustomer {
    pub id: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub mobile: Option<String>,
    pub mobile_code: Option<String>,
    pub gender: Option<Slug<Gender>>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalOrder {
    pub id: String,
    pub reference_id: String,
    pub status: Slug<OrderStatus>,
    pub total: Money,
    pub sub_total: Option<Money>,
    pub shipping_cost: Option<Money>,
    pub discount: Option<Money>,
    pub customer_id: Option<String>,
    pub payment_method: Option<String>,
    pub item_ids: Vec<String>,
    pub shipping_address: Option<Address>,
    pub ordered_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalOrderItem {
    pub id: String,
    pub order_id: String,
    pub product_id: Option<String>,
    pub name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit_price: Option<Money>,
    pub total: Money,
    pub options: Option<Value>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalShipment {
    pub id: String,
    pub order_id: String,
    pub courier_name: Option<String>,
    pub tracking_number: Option<String>,
    pub tracking_link: Option<String>,
    pub status: Slug<ShipmentStatus>,
    pub shipping_cost: Option<Money>,
    pub ship_to: Option<Address>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCoupon {
    pub id: String,
    pub code: String,
    pub coupon_type: Slug<CouponType>,
    pub amount: Money,
    pub free_shipping: bool,
    pub status: Slug<CouponStatus>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub usage_limit: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

/// Closed union of every payload shape the engine mirrors.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalEntity {
    Store(ExternalStore),
    Brand(ExternalBrand),
    Category(ExternalCategory),
    Product(ExternalProduct),
    Customer(ExternalCustomer),
    Order(ExternalOrder),
    OrderItem(ExternalOrderItem),
    Shipment(ExternalShipment),
    Coupon(ExternalCoupon),
}

impl ExternalEntity {
    /// Decodes a raw payload into the typed shape for `kind`.
    pub fn decode(kind: EntityKind, payload: &Value) -> MapResult<Self> {
        let reader = PayloadReader::root(kind, payload)?;
        Ok(match kind {
            EntityKind::Store => Self::Store(decode_store(&reader)?),
            EntityKind::Brand => Self::Brand(decode_brand(&reader)?),
            EntityKind::Category => Self::Category(decode_category(&reader)?),
            EntityKind::Product => Self::Product(decode_product(&reader)?),
            EntityKind::Customer => Self::Customer(decode_customer(&reader)?),
            EntityKind::Order => Self::Order(decode_order(&reader)?),
            EntityKind::OrderItem => Self::OrderItem(decode_order_item(&reader)?),
            EntityKind::Shipment => Self::Shipment(decode_shipment(&reader)?),
            EntityKind::Coupon => Self::Coupon(decode_coupon(&reader)?),
        })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Store(_) => EntityKind::Store,
            Self::Brand(_) => EntityKind::Brand,
            Self::Category(_) => EntityKind::Category,
            Self::Product(_) => EntityKind::Product,
            Self::Customer(_) => EntityKind::Customer,
            Self::Order(_) => EntityKind::Order,
            Self::OrderItem(_) => EntityKind::OrderItem,
            Self::Shipment(_) => EntityKind::Shipment,
            Self::Coupon(_) => EntityKind::Coupon,
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            Self::Store(e) => &e.id,
            Self::Brand(e) => &e.id,
            Self::Category(e) => &e.id,
            Self::Product(e) => &e.id,
            Self::Customer(e) => &e.id,
            Self::Order(e) => &e.id,
            Self::OrderItem(e) => &e.id,
            Self::Shipment(e) => &e.id,
            Self::Coupon(e) => &e.id,
        }
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Store(e) => e.updated_at,
            Self::Brand(e) => e.updated_at,
            Self::Category(e) => e.updated_at,
            Self::Product(e) => e.updated_at,
            Self::Customer(e) => e.updated_at,
            Self::Order(e) => e.updated_at,
            Self::OrderItem(e) => e.updated_at,
            Self::Shipment(e) => e.updated_at,
            Self::Coupon(e) => e.updated_at,
        }
    }
}

fn decode_store(r: &PayloadReader<'_>) -> MapResult<ExternalStore> {
    Ok(ExternalStore {
        id: r.id("id")?,
        name: r.string("name")?,
        email: r.opt_string("email")?,
        domain: r.opt_string("domain")?,
        currency: r.opt_currency("currency")?,
        plan: r.opt_string("plan")?,
        status: r.opt_string("status")?,
        updated_at: r.opt_datetime("updated_at")?,
        metadata: r.raw("metadata"),
    })
}

fn decode_brand(r: &PayloadReader<'_>) -> MapResult<ExternalBrand> {
    Ok(ExternalBrand {
        id: r.id("id")?,
        name: r.string("name")?,
        logo_url: r.opt_string("logo")?,
        description: r.opt_string("description")?,
        updated_at: r.opt_datetime("updated_at")?,
        metadata: r.raw("metadata"),
    })
}

fn decode_category(r: &PayloadReader<'_>) -> MapResult<ExternalCategory> {
    // Root categories carry parent_id 0.
    let parent_id = r.opt_id("parent_id")?.filter(|id| id != "0");
    Ok(ExternalCategory {
        id: r.id("id")?,
        name: r.string("name")?,
        parent_id,
        status: r.opt_slug("status")?,
        sort_order: r.opt_i64("sort_order")?,
        image_url: r.opt_string("image")?,
        updated_at: r.opt_datetime("updated_at")?,
        metadata: r.raw("metadata"),
    })
}

fn decode_product(r: &PayloadReader<'_>) -> MapResult<ExternalProduct> {
    let price = r.money("price")?;
    let sale_price = r.opt_money("sale_price")?;
    let regular_price = r.opt_money("regular_price")?;
    r.check_currencies(&[
        ("price", Some(&price)),
        ("sale_price", sale_price.as_ref()),
        ("regular_price", regular_price.as_ref()),
    ])?;

    let brand_id = match r.opt_object("brand")? {
        Some(brand) => brand.opt_id("id")?,
        None => r.opt_id("brand_id")?,
    };

    let mut category_ids = Vec::new();
    for category in r.objects("categories")? {
        category_ids.push(category.id("id")?);
    }

    let mut images = Vec::new();
    for image in r.objects("images")? {
        images.push(ProductImage {
            id: image.opt_id("id")?,
            url: image.string("url")?,
            main: image.opt_bool("main")?.unwrap_or(false),
        });
    }

    let mut options = Vec::new();
    for option in r.objects("options")? {
        let mut values = Vec::new();
        for value in option.objects("values")? {
            values.push(ProductOptionValue {
                id: value.opt_id("id")?,
                name: value.string("name")?,
                price: value.opt_money("price")?,
            });
        }
        options.push(ProductOption {
            id: option.opt_id("id")?,
            name: option.string("name")?,
            values,
        });
    }

    let mut variants = Vec::new();
    for sku in r.objects("skus")? {
        variants.push(ProductVariant {
            id: sku.id("id")?,
            sku: sku.opt_string("sku")?,
            price: sku.opt_money("price")?,
            stock_quantity: sku.opt_i64("stock_quantity")?,
        });
    }

    Ok(ExternalProduct {
        id: r.id("id")?,
        name: r.string("name")?,
        sku: r.opt_string("sku")?,
        price,
        sale_price,
        regular_price,
        quantity: r.opt_i64("quantity")?,
        unlimited_quantity: r.opt_bool("unlimited_quantity")?.unwrap_or(false),
        status: r.slug("status")?,
        product_type: r.opt_slug("type")?,
        brand_id,
        category_ids,
        images,
        options,
        variants,
        updated_at: r.opt_datetime("updated_at")?,
        metadata: r.raw("metadata"),
    })
}

fn decode_customer(r: &PayloadReader<'_>) -> MapResult<ExternalCustomer> {
    Ok(ExternalCustomer {
        id: r.id("id")?,
        first_name: r.string("first_name")?,
        last_name: r.opt_string("last_name")?,
        email: r.opt_string("email")?,
        mobile: r.opt_string("mobile")?,
        mobile_code: r.opt_string("mobile_code")?,
        gender: r.opt_slug("gender")?,
        city: r.opt_string("city")?,
        country: r.opt_string("country")?,
        updated_at: r.opt_datetime("updated_at")?,
        metadata: r.raw("metadata"),
    })
}

fn decode_order(r: &PayloadReader<'_>) -> MapResult<ExternalOrder> {
    let amounts = r
        .opt_object("amounts")?
        .ok_or_else(|| r.missing("amounts"))?;
    let total = amounts.money("total")?;
    let sub_total = amounts.opt_money("sub_total")?;
    let shipping_cost = amounts.opt_money("shipping_cost")?;
    let discount = amounts.opt_money("discount")?;
    amounts.check_currencies(&[
        ("total", Some(&total)),
        ("sub_total", sub_total.as_ref()),
        ("shipping_cost", shipping_cost.as_ref()),
        ("discount", discount.as_ref()),
    ])?;

    let customer_id = match r.opt_object("customer")? {
        Some(customer) => customer.opt_id("id")?,
        None => None,
    };

    let mut item_ids = Vec::new();
    for item in r.objects("items")? {
        item_ids.push(item.id("id")?);
    }

    let shipping_address = match r.opt_object("shipping")? {
        Some(shipping) => match shipping.opt_object("address")? {
            Some(address) => Some(address.address()?),
            None => None,
        },
        None => None,
    };

    Ok(ExternalOrder {
        id: r.id("id")?,
        reference_id: r.id("reference_id")?,
        status: r.slug("status")?,
        total,
        sub_total,
        shipping_cost,
        discount,
        customer_id,
        payment_method: r.opt_string("payment_method")?,
        item_ids,
        shipping_address,
        ordered_at: r.opt_datetime("date")?,
        updated_at: r.opt_datetime("updated_at")?,
        metadata: r.raw("metadata"),
    })
}

fn decode_order_item(r: &PayloadReader<'_>) -> MapResult<ExternalOrderItem> {
    let amounts = r
        .opt_object("amounts")?
        .ok_or_else(|| r.missing("amounts"))?;
    let unit_price = amounts.opt_money("price_without_tax")?;
    let total = amounts.money("total")?;
    amounts.check_currencies(&[
        ("price_without_tax", unit_price.as_ref()),
        ("total", Some(&total)),
    ])?;

    let product_id = match r.opt_object("product")? {
        Some(product) => product.opt_id("id")?,
        None => r.opt_id("product_id")?,
    };

    Ok(ExternalOrderItem {
        id: r.id("id")?,
        order_id: r.id("order_id")?,
        product_id,
        name: r.string("name")?,
        sku: r.opt_string("sku")?,
        quantity: r.i64("quantity")?,
        unit_price,
        total,
        options: r.raw("options"),
        updated_at: r.opt_datetime("updated_at")?,
        metadata: r.raw("metadata"),
    })
}

fn decode_shipment(r: &PayloadReader<'_>) -> MapResult<ExternalShipment> {
    let ship_to = match r.opt_object("ship_to")? {
        Some(address) => Some(address.address()?),
        None => None,
    };
    Ok(ExternalShipment {
        id: r.id("id")?,
        order_id: r.id("order_id")?,
        courier_name: r.opt_string("courier_name")?,
        tracking_number: r.opt_string("tracking_number")?,
        tracking_link: r.opt_string("tracking_link")?,
        status: r.slug("status")?,
        shipping_cost: r.opt_money("shipping_cost")?,
        ship_to,
        updated_at: r.opt_datetime("updated_at")?,
        metadata: r.raw("metadata"),
    })
}

fn decode_coupon(r: &PayloadReader<'_>) -> MapResult<ExternalCoupon> {
    Ok(ExternalCoupon {
        id: r.id("id")?,
        code: r.string("code")?,
        coupon_type: r.slug("type")?,
        amount: r.money("amount")?,
        free_shipping: r.opt_bool("free_shipping")?.unwrap_or(false),
        status: r.slug("status")?,
        expiry_date: r.opt_datetime("expiry_date")?,
        usage_limit: r.opt_i64("usage_limit")?,
        updated_at: r.opt_datetime("updated_at")?,
        metadata: r.raw("metadata"),
    })
}

/// Field-level accessor over a JSON object that reports failures by path.
pub struct PayloadReader<'a> {
    kind: EntityKind,
    object: &'a Map<String, Value>,
    prefix: String,
}

impl<'a> PayloadReader<'a> {
    pub fn root(kind: EntityKind, payload: &'a Value) -> MapResult<Self> {
        match payload {
            Value::Object(object) => Ok(Self {
                kind,
                object,
                prefix: String::new(),
            }),
            _ => Err(MappingError::new(kind, "$", "payload must be a JSON object")),
        }
    }

    fn path(&self, field: &str) -> String {
        if self.prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", self.prefix, field)
        }
    }

    fn missing(&self, field: &str) -> MappingError {
        MappingError::missing(self.kind, self.path(field))
    }

    fn invalid(&self, field: &str, reason: impl Into<String>) -> MappingError {
        MappingError::new(self.kind, self.path(field), reason)
    }

    /// Present and non-null value.
    fn get(&self, field: &str) -> Option<&'a Value> {
        self.object.get(field).filter(|value| !value.is_null())
    }

    pub fn id(&self, field: &str) -> MapResult<String> {
        self.opt_id(field)?.ok_or_else(|| self.missing(field))
    }

    pub fn opt_id(&self, field: &str) -> MapResult<Option<String>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(value)) if value.trim().is_empty() => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.trim().to_string())),
            Some(Value::Number(value)) if value.is_i64() || value.is_u64() => {
                Ok(Some(value.to_string()))
            }
            Some(_) => Err(self.invalid(field, "expected a string or integer identifier")),
        }
    }

    pub fn string(&self, field: &str) -> MapResult<String> {
        self.opt_string(field)?.ok_or_else(|| self.missing(field))
    }

    pub fn opt_string(&self, field: &str) -> MapResult<Option<String>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(Value::Number(value)) => Ok(Some(value.to_string())),
            Some(_) => Err(self.invalid(field, "expected a string")),
        }
    }

    fn opt_currency(&self, field: &str) -> MapResult<Option<String>> {
        match self.opt_string(field)? {
            None => Ok(None),
            Some(code) => normalize_currency(&code)
                .map(Some)
                .ok_or_else(|| self.invalid(field, format!("invalid currency code '{}'", code))),
        }
    }

    pub fn i64(&self, field: &str) -> MapResult<i64> {
        self.opt_i64(field)?.ok_or_else(|| self.missing(field))
    }

    /// Integers outside the i64 range are clamped, fractional values rejected.
    pub fn opt_i64(&self, field: &str) -> MapResult<Option<i64>> {
        let value = match self.get(field) {
            None => return Ok(None),
            Some(value) => value,
        };
        let parsed = match value {
            Value::Number(number) => {
                if let Some(v) = number.as_i64() {
                    Some(v)
                } else if number.as_u64().is_some() {
                    Some(self.clamped(field, i64::MAX))
                } else {
                    number.as_f64().and_then(|f| self.integral_f64(field, f))
                }
            }
            Value::String(text) if text.trim().is_empty() => return Ok(None),
            Value::String(text) => match text.trim().parse::<i64>() {
                Ok(v) => Some(v),
                Err(_) => Decimal::from_str(text.trim())
                    .ok()
                    .filter(|d| d.fract().is_zero())
                    .map(|d| {
                        i64::try_from(d.mantissa() / 10_i128.pow(d.scale())).unwrap_or_else(|_| {
                            self.clamped(field, if d.is_sign_negative() { i64::MIN } else { i64::MAX })
                        })
                    }),
            },
            _ => None,
        };
        parsed
            .map(Some)
            .ok_or_else(|| self.invalid(field, "expected an integer"))
    }

    fn integral_f64(&self, field: &str, value: f64) -> Option<i64> {
        if !value.is_finite() || value.fract() != 0.0 {
            return None;
        }
        if value >= i64::MAX as f64 {
            return Some(self.clamped(field, i64::MAX));
        }
        if value <= i64::MIN as f64 {
            return Some(self.clamped(field, i64::MIN));
        }
        Some(value as i64)
    }

    fn clamped(&self, field: &str, bound: i64) -> i64 {
        warn!(
            "[EntityMapper] {} field '{}' out of range, clamped to {}",
            self.kind,
            self.path(field),
            bound
        );
        bound
    }

    /// Accepts booleans and 0/1 flags.
    pub fn opt_bool(&self, field: &str) -> MapResult<Option<bool>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(*value)),
            Some(Value::Number(value)) => match value.as_i64() {
                Some(0) => Ok(Some(false)),
                Some(1) => Ok(Some(true)),
                _ => Err(self.invalid(field, "expected a boolean")),
            },
            Some(_) => Err(self.invalid(field, "expected a boolean")),
        }
    }

    pub fn money(&self, field: &str) -> MapResult<Money> {
        self.opt_money(field)?.ok_or_else(|| self.missing(field))
    }

    pub fn opt_money(&self, field: &str) -> MapResult<Option<Money>> {
        let value = match self.get(field) {
            None => return Ok(None),
            Some(value) => value,
        };
        match value {
            Value::Object(_) => {
                let nested = self.nested(field, value);
                let amount = nested
                    .get("amount")
                    .ok_or_else(|| nested.missing("amount"))?;
                Ok(Some(Money {
                    amount: nested.decimal("amount", amount)?,
                    currency: nested.opt_currency("currency")?,
                }))
            }
            Value::Number(_) | Value::String(_) => Ok(Some(Money {
                amount: self.decimal(field, value)?,
                currency: None,
            })),
            _ => Err(self.invalid(field, "expected an amount or {amount, currency} object")),
        }
    }

    fn decimal(&self, field: &str, value: &Value) -> MapResult<Decimal> {
        let text = match value {
            Value::Number(number) => number.to_string(),
            Value::String(text) => text.trim().to_string(),
            _ => return Err(self.invalid(field, "expected a numeric amount")),
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|_| self.invalid(field, format!("amount '{}' is not representable", text)))
    }

    /// All present amounts must share one currency.
    fn check_currencies(&self, amounts: &[(&str, Option<&Money>)]) -> MapResult<()> {
        let mut expected: Option<&str> = None;
        for (field, money) in amounts {
            let currency = match money.and_then(|m| m.currency.as_deref()) {
                Some(code) => code,
                None => continue,
            };
            match expected {
                None => expected = Some(currency),
                Some(code) if code == currency => {}
                Some(code) => {
                    return Err(self.invalid(
                        &format!("{}.currency", field),
                        format!("currency {} differs from {}", currency, code),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn slug<T: PlatformEnum>(&self, field: &str) -> MapResult<Slug<T>> {
        self.opt_slug(field)?.ok_or_else(|| self.missing(field))
    }

    /// Reads a slug from a string or an object carrying `slug`.
    pub fn opt_slug<T: PlatformEnum>(&self, field: &str) -> MapResult<Option<Slug<T>>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(raw)) if raw.trim().is_empty() => {
                Err(self.invalid(field, "empty enum value"))
            }
            Some(Value::String(raw)) => Ok(Some(Slug::parse(raw.trim()))),
            Some(value @ Value::Object(_)) => self.nested(field, value).opt_slug("slug"),
            Some(_) => Err(self.invalid(field, "expected a string slug")),
        }
    }

    pub fn opt_datetime(&self, field: &str) -> MapResult<Option<DateTime<Utc>>> {
        match self.get(field) {
            None => Ok(None),
            Some(value) => parse_platform_datetime(value)
                .map(Some)
                .ok_or_else(|| self.invalid(field, "unrecognised timestamp")),
        }
    }

    pub fn opt_object(&self, field: &str) -> MapResult<Option<PayloadReader<'a>>> {
        match self.get(field) {
            None => Ok(None),
            Some(value @ Value::Object(_)) => Ok(Some(self.nested(field, value))),
            Some(_) => Err(self.invalid(field, "expected an object")),
        }
    }

    /// Readers for each element of an array of objects; missing means empty.
    pub fn objects(&self, field: &str) -> MapResult<Vec<PayloadReader<'a>>> {
        match self.get(field) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(idx, item)| match item {
                    Value::Object(object) => Ok(PayloadReader {
                        kind: self.kind,
                        object,
                        prefix: format!("{}[{}]", self.path(field), idx),
                    }),
                    _ => Err(self.invalid(&format!("{}[{}]", field, idx), "expected an object")),
                })
                .collect(),
            Some(_) => Err(self.invalid(field, "expected an array")),
        }
    }

    fn address(&self) -> MapResult<Address> {
        Ok(Address {
            country: self.opt_string("country")?,
            city: self.opt_string("city")?,
            address_line: match self.opt_string("address_line")? {
                Some(line) => Some(line),
                None => self.opt_string("street")?,
            },
            postal_code: self.opt_string("postal_code")?,
        })
    }

    /// Opaque passthrough of a nested value.
    pub fn raw(&self, field: &str) -> Option<Value> {
        self.get(field).cloned()
    }

    fn nested(&self, field: &str, value: &'a Value) -> PayloadReader<'a> {
        let object = match value {
            Value::Object(object) => object,
            // Callers only pass objects.
            _ => self.object,
        };
        PayloadReader {
            kind: self.kind,
            object,
            prefix: self.path(field),
        }
    }
}

/// Upper-cases an ISO 4217 code; `None` when it is not three letters.
pub fn normalize_currency(code: &str) -> Option<String> {
    let trimmed = code.trim();
    if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(trimmed.to_ascii_uppercase())
    } else {
        None
    }
}

/// Parses the timestamp shapes the platform emits:
/// RFC 3339 strings, naive `YYYY-MM-DD HH:MM:SS` strings (platform offset),
/// unix seconds or millis, and `{date, timezone}` objects.
pub fn parse_platform_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_datetime_str(text, None),
        Value::Number(number) => {
            let raw = number.as_i64()?;
            if raw.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        Value::Object(object) => {
            let date = object.get("date")?.as_str()?;
            let offset = object
                .get("timezone")
                .and_then(Value::as_str)
                .and_then(timezone_offset);
            parse_datetime_str(date, offset)
        }
        _ => None,
    }
}

fn timezone_offset(name: &str) -> Option<FixedOffset> {
    match name {
        "UTC" | "Z" | "Etc/UTC" => FixedOffset::east_opt(0),
        "Asia/Riyadh" => FixedOffset::east_opt(PLATFORM_UTC_OFFSET_SECS),
        other => DateTime::parse_from_str(&format!("2000-01-01 00:00:00 {}", other), "%Y-%m-%d %H:%M:%S %:z")
            .ok()
            .map(|dt| *dt.offset()),
    }
}

fn parse_datetime_str(text: &str, offset: Option<FixedOffset>) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    let offset = offset.or_else(|| FixedOffset::east_opt(PLATFORM_UTC_OFFSET_SECS))?;
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}
