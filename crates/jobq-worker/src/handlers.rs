//! Built-in job handlers.

use anyhow::{anyhow, bail};
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::registry::HandlerResult;

/// Diagnostic handler: echoes the payload back.
pub async fn ping(_db: PgPool, payload: Value) -> HandlerResult {
    Ok(json!({ "ok": true, "payload": payload }))
}

/// Round to 3 decimals and normalize negative zero so `-0.0003` and `0.0003`
/// land on the same rendered coordinate sign.
fn round3(v: f64) -> f64 {
    let rounded = (v * 1000.0).round() / 1000.0;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

fn location_key(lat: f64, lon: f64) -> String {
    format!("{lat:.3},{lon:.3}")
}

fn coordinate(payload: &Value, field: &str, min: f64, max: f64) -> anyhow::Result<f64> {
    let v = payload
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("{field} must be a number"))?;
    if v < min || v > max {
        bail!("{field} must be between {min} and {max}, got {v}");
    }
    Ok(v)
}

/// Upsert a `locations` row keyed by the rounded coordinate pair. Idempotent
/// under duplicate execution: the conflict branch returns the existing id.
pub async fn location_upsert(db: PgPool, payload: Value) -> HandlerResult {
    let lat = round3(coordinate(&payload, "lat", -90.0, 90.0)?);
    let lon = round3(coordinate(&payload, "lon", -180.0, 180.0)?);
    let key = location_key(lat, lon);

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO locations (key, lat, lon)
        VALUES ($1, $2, $3)
        ON CONFLICT (key) DO UPDATE SET lat = EXCLUDED.lat, lon = EXCLUDED.lon
        RETURNING id
        "#,
    )
    .bind(&key)
    .bind(lat)
    .bind(lon)
    .fetch_one(&db)
    .await?;

    Ok(json!({
        "locationId": id,
        "locationKey": key,
        "lat": lat,
        "lon": lon,
    }))
}
