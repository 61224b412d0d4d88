use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use vantage_core::{ObjectId, TenantId};

/// Metric names read from `current_metrics` during derivation.
pub const STOCK_ON_HAND: &str = "stock_on_hand";
pub const LEAD_TIME_DAYS: &str = "lead_time_days";
pub const UNIT_PRICE: &str = "unit_price";

/// A business entity under rule evaluation (SKU, campaign, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredObject {
    pub id: ObjectId,
    pub tenant_id: TenantId,
    pub object_type: String,
    pub external_id: String,
    #[serde(default)]
    pub current_metrics: BTreeMap<String, f64>,
    /// Free-form grouping labels (e.g. `supplier`, `category`).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Upstream objects this one consumes (components, feeder campaigns).
    #[serde(default)]
    pub depends_on: Vec<ObjectId>,
    /// Units sold per day, oldest first, ending at the detection date.
    #[serde(default)]
    pub daily_sales: Vec<f64>,
    /// Populated by the refresh step; `None` until the first detection pass.
    #[serde(default)]
    pub derived: Option<DerivedMetrics>,
}

impl MonitoredObject {
    pub fn new(tenant_id: TenantId, object_type: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            id: ObjectId::new(),
            tenant_id,
            object_type: object_type.into(),
            external_id: external_id.into(),
            current_metrics: BTreeMap::new(),
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
            daily_sales: Vec::new(),
            derived: None,
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.current_metrics.insert(name.into(), value);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_sales(mut self, daily_sales: Vec<f64>) -> Self {
        self.daily_sales = daily_sales;
        self
    }

    pub fn depending_on(mut self, upstream: ObjectId) -> Self {
        self.depends_on.push(upstream);
        self
    }

    /// Resolve a metric by name: derived fields first, then `current_metrics`.
    ///
    /// An undefined derived value (days of stock at zero velocity) falls back
    /// to a raw metric of the same name. `None` means "not applicable".
    pub fn metric(&self, name: &str) -> Option<f64> {
        if let Some(derived) = &self.derived {
            let value = match name {
                "sales_velocity" => Some(derived.sales_velocity),
                "days_of_stock" => derived.days_of_stock,
                "trend_percent" => Some(derived.trend_percent),
                "reorder_point" => Some(derived.reorder_point),
                "stockout_risk_days" => derived.stockout_risk_days,
                _ => None,
            };
            if value.is_some() {
                return value;
            }
        }
        self.current_metrics.get(name).copied()
    }

    /// True when the object will run out before a replenishment could land.
    pub fn at_risk(&self, max_stockout_risk_days: f64) -> bool {
        self.derived
            .as_ref()
            .and_then(|d| d.stockout_risk_days)
            .is_some_and(|r| r <= max_stockout_risk_days)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

/// Fields recomputed by every detection pass before any rule reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    /// Mean units per day over the velocity window.
    pub sales_velocity: f64,
    /// Stock on hand divided by velocity; undefined at zero velocity.
    pub days_of_stock: Option<f64>,
    pub trend_direction: TrendDirection,
    /// Recent window vs the window before it, in percent.
    pub trend_percent: f64,
    pub reorder_point: f64,
    /// Days of stock left once the lead time has elapsed; negative means a gap.
    pub stockout_risk_days: Option<f64>,
}

/// Tunables for `derive_metrics`.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivationPolicy {
    pub velocity_window_days: usize,
    pub trend_window_days: usize,
    /// Trend changes within ±this percentage count as flat.
    pub flat_band_percent: f64,
    pub safety_stock_days: f64,
    /// Used when the object carries no `lead_time_days` metric.
    pub default_lead_time_days: f64,
}

impl Default for DerivationPolicy {
    fn default() -> Self {
        Self {
            velocity_window_days: 14,
            trend_window_days: 7,
            flat_band_percent: 5.0,
            safety_stock_days: 3.0,
            default_lead_time_days: 7.0,
        }
    }
}

/// Recompute derived metrics from the object's raw metrics and sales history.
pub fn derive_metrics(object: &MonitoredObject, policy: &DerivationPolicy) -> DerivedMetrics {
    let sales = &object.daily_sales;

    let velocity_window = tail(sales, policy.velocity_window_days);
    let sales_velocity = mean(velocity_window);

    let lead_time = object
        .current_metrics
        .get(LEAD_TIME_DAYS)
        .copied()
        .unwrap_or(policy.default_lead_time_days);

    let days_of_stock = match object.current_metrics.get(STOCK_ON_HAND) {
        Some(stock) if sales_velocity > 0.0 => Some(stock / sales_velocity),
        _ => None,
    };

    let (trend_direction, trend_percent) = trend(sales, policy);

    DerivedMetrics {
        sales_velocity,
        days_of_stock,
        trend_direction,
        trend_percent,
        reorder_point: sales_velocity * (lead_time + policy.safety_stock_days),
        stockout_risk_days: days_of_stock.map(|d| d - lead_time),
    }
}

fn trend(sales: &[f64], policy: &DerivationPolicy) -> (TrendDirection, f64) {
    let w = policy.trend_window_days;
    if w == 0 || sales.len() < w * 2 {
        return (TrendDirection::Flat, 0.0);
    }

    let recent = mean(&sales[sales.len() - w..]);
    let prior = mean(&sales[sales.len() - 2 * w..sales.len() - w]);

    let pct = if prior > 0.0 {
        (recent - prior) / prior * 100.0
    } else if recent > 0.0 {
        100.0
    } else {
        0.0
    };

    let direction = if pct > policy.flat_band_percent {
        TrendDirection::Up
    } else if pct < -policy.flat_band_percent {
        TrendDirection::Down
    } else {
        TrendDirection::Flat
    };

    (direction, pct)
}

fn tail(xs: &[f64], n: usize) -> &[f64] {
    &xs[xs.len().saturating_sub(n)..]
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / (xs.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sku() -> MonitoredObject {
        MonitoredObject::new(TenantId::new(), "sku", "SKU-1")
    }

    #[test]
    fn velocity_and_days_of_stock() {
        let obj = sku()
            .with_metric(STOCK_ON_HAND, 30.0)
            .with_metric(LEAD_TIME_DAYS, 5.0)
            .with_sales(vec![10.0; 14]);

        let d = derive_metrics(&obj, &DerivationPolicy::default());
        assert_eq!(d.sales_velocity, 10.0);
        assert_eq!(d.days_of_stock, Some(3.0));
        assert_eq!(d.stockout_risk_days, Some(-2.0));
        assert_eq!(d.reorder_point, 80.0);
        assert_eq!(d.trend_direction, TrendDirection::Flat);
    }

    #[test]
    fn zero_velocity_leaves_days_of_stock_undefined() {
        let obj = sku().with_metric(STOCK_ON_HAND, 30.0).with_sales(vec![0.0; 14]);
        let d = derive_metrics(&obj, &DerivationPolicy::default());
        assert_eq!(d.days_of_stock, None);
        assert_eq!(d.stockout_risk_days, None);
    }

    #[test]
    fn trend_compares_recent_window_to_prior_window() {
        let mut sales = vec![10.0; 7];
        sales.extend(vec![15.0; 7]);
        let obj = sku().with_sales(sales);

        let d = derive_metrics(&obj, &DerivationPolicy::default());
        assert_eq!(d.trend_direction, TrendDirection::Up);
        assert!((d.trend_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn short_history_is_flat() {
        let obj = sku().with_sales(vec![1.0, 50.0, 100.0]);
        let d = derive_metrics(&obj, &DerivationPolicy::default());
        assert_eq!(d.trend_direction, TrendDirection::Flat);
        assert_eq!(d.trend_percent, 0.0);
    }

    #[test]
    fn metric_lookup_prefers_derived_values() {
        let mut obj = sku().with_metric("days_of_stock", 99.0).with_metric("roas", 2.5);
        assert_eq!(obj.metric("days_of_stock"), Some(99.0));

        obj.derived = Some(DerivedMetrics {
            sales_velocity: 1.0,
            days_of_stock: Some(4.0),
            trend_direction: TrendDirection::Flat,
            trend_percent: 0.0,
            reorder_point: 10.0,
            stockout_risk_days: Some(-3.0),
        });
        assert_eq!(obj.metric("days_of_stock"), Some(4.0));
        assert_eq!(obj.metric("roas"), Some(2.5));
        assert_eq!(obj.metric("missing"), None);
        assert!(obj.at_risk(0.0));
    }
}
