use crate::core::{
    ExchangeId, Order, OrderId, OrderSide, OrderStatus, OrderType, Position, PositionSide,
};
use crate::exchanges::{CancelOutcome, ExchangeAdapter, ExchangeError, OrderSpec};
use crate::types::{Price, Size, Symbol};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

/// Canonical symbol -> Kraken futures perpetual native spelling
const SYMBOL_TABLE: &[(&str, &str)] = &[
    ("BTC/USD", "PF_XBTUSD"),
    ("ETH/USD", "PF_ETHUSD"),
    ("SOL/USD", "PF_SOLUSD"),
    ("XRP/USD", "PF_XRPUSD"),
];

/// Kraken futures adapter.
///
/// Kraken has no native bracket orders, which is why the engine carries its
/// own exit-leg supervision.
pub struct KrakenAdapter {
    api_key: String,
    api_secret: String,
    rest_url: String,
    http_client: Client,
}

impl KrakenAdapter {
    pub fn new(api_key: String, api_secret: String, demo: bool) -> Self {
        let rest_url = if demo {
            "https://demo-futures.kraken.com/derivatives".to_string()
        } else {
            "https://futures.kraken.com/derivatives".to_string()
        };

        Self {
            api_key,
            api_secret,
            rest_url,
            http_client: Client::new(),
        }
    }

    pub fn with_rest_url(mut self, url: impl Into<String>) -> Self {
        self.rest_url = url.into();
        self
    }

    fn native_symbol(&self, symbol: &Symbol) -> Result<&'static str, ExchangeError> {
        SYMBOL_TABLE
            .iter()
            .find(|(canonical, _)| *canonical == symbol.as_str())
            .map(|(_, native)| *native)
            .ok_or_else(|| ExchangeError::UnsupportedSymbol {
                raw: symbol.as_str().to_string(),
                exchange: "kraken".to_string(),
            })
    }

    fn canonical_symbol(native: &str) -> Symbol {
        let upper = native.to_uppercase();
        SYMBOL_TABLE
            .iter()
            .find(|(_, n)| *n == upper)
            .map(|(canonical, _)| Symbol::new(*canonical))
            .unwrap_or_else(|| Symbol::new(upper))
    }

    /// Authent header: HMAC-SHA512 over SHA256(postData + nonce + path),
    /// keyed with the base64-decoded secret
    fn sign(&self, post_data: &str, nonce: &str, path: &str) -> Result<String, ExchangeError> {
        let mut hasher = Sha256::new();
        hasher.update(post_data.as_bytes());
        hasher.update(nonce.as_bytes());
        hasher.update(path.as_bytes());
        let digest = hasher.finalize();

        let secret = general_purpose::STANDARD
            .decode(&self.api_secret)
            .map_err(|e| ExchangeError::Auth {
                message: format!("kraken secret is not valid base64: {}", e),
            })?;
        let mut mac = Hmac::<Sha512>::new_from_slice(&secret)
            .expect("HMAC can take key of any size");
        mac.update(&digest);
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Kraken reports failures as error strings rather than numeric codes
    fn map_error(err: &str) -> ExchangeError {
        let lower = err.to_lowercase();
        if lower.contains("apilimitexceeded") || lower.contains("ratelimit") {
            ExchangeError::RateLimited {
                message: format!("kraken: {}", err),
                retry_after: None,
            }
        } else if lower.contains("authentication")
            || lower.contains("invalidapikey")
            || lower.contains("requiredargumentmissing:authent")
        {
            ExchangeError::Auth {
                message: format!("kraken: {}", err),
            }
        } else if lower.contains("invalidunit") || lower.contains("symbol") {
            ExchangeError::UnsupportedSymbol {
                raw: err.to_string(),
                exchange: "kraken".to_string(),
            }
        } else if lower.contains("nonce") || lower.contains("unavailable") {
            ExchangeError::transient(format!("kraken: {}", err))
        } else {
            ExchangeError::rejected(format!("kraken: {}", err))
        }
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<Value, ExchangeError> {
        let nonce = Utc::now().timestamp_millis().to_string();
        let post_data = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let authent = self.sign(&post_data, &nonce, path)?;

        let url = if post_data.is_empty() {
            format!("{}{}", self.rest_url, path)
        } else {
            format!("{}{}?{}", self.rest_url, path, post_data)
        };

        let response = self
            .http_client
            .request(method, &url)
            .header("APIKey", &self.api_key)
            .header("Nonce", &nonce)
            .header("Authent", authent)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited {
                message: format!("kraken http {}", status),
                retry_after: None,
            });
        }
        if status.is_server_error() {
            return Err(ExchangeError::transient(format!("kraken http {}", status)));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::transient(format!("kraken response parse: {}", e)))?;

        if json.get("result").and_then(|v| v.as_str()) == Some("error") {
            let err = json
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(Self::map_error(err));
        }
        Ok(json)
    }

    fn parse_open_order(&self, row: &Value) -> Option<Order> {
        let native = row.get("symbol").and_then(|v| v.as_str())?;
        let status = match row.get("status").and_then(|v| v.as_str())? {
            "untouched" | "placed" => OrderStatus::New,
            "partiallyFilled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "cancelled" => OrderStatus::Cancelled,
            _ => return None,
        };
        let side = match row.get("side").and_then(|v| v.as_str())? {
            "buy" => OrderSide::Buy,
            "sell" => OrderSide::Sell,
            _ => return None,
        };
        let order_type = match row.get("orderType").and_then(|v| v.as_str())? {
            "lmt" => OrderType::Limit,
            "stp" => OrderType::StopMarket,
            "mkt" => OrderType::Market,
            _ => return None,
        };
        let quantity = Size::new(Decimal::try_from(
            row.get("unfilledSize")
                .or_else(|| row.get("size"))
                .and_then(|v| v.as_f64())?,
        ).ok()?);

        let created_at = row
            .get("receivedTime")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);

        Some(Order {
            id: row.get("order_id").and_then(|v| v.as_str())?.to_string(),
            client_order_id: row
                .get("cliOrdId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            exchange: "kraken".to_string(),
            symbol: Self::canonical_symbol(native),
            side,
            order_type,
            status,
            quantity,
            filled_quantity: Size::new(
                row.get("filledSize")
                    .and_then(|v| v.as_f64())
                    .and_then(|f| Decimal::try_from(f).ok())
                    .unwrap_or(Decimal::ZERO),
            ),
            price: row
                .get("limitPrice")
                .and_then(|v| v.as_f64())
                .and_then(|f| Decimal::try_from(f).ok())
                .map(Price::new),
            trigger_price: row
                .get("stopPrice")
                .and_then(|v| v.as_f64())
                .and_then(|f| Decimal::try_from(f).ok())
                .map(Price::new),
            avg_fill_price: None,
            reduce_only: row
                .get("reduceOnly")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            created_at,
            filled_at: None,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for KrakenAdapter {
    fn id(&self) -> ExchangeId {
        "kraken".to_string()
    }

    async fn fetch_positions(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<Vec<Position>, ExchangeError> {
        let json = self
            .signed_request(reqwest::Method::GET, "/api/v3/openpositions", Vec::new())
            .await?;

        let rows = json
            .get("openPositions")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::transient("kraken openpositions: missing list"))?;

        let mut positions = Vec::new();
        for row in rows {
            let Some(size) = row
                .get("size")
                .and_then(|v| v.as_f64())
                .and_then(|f| Decimal::try_from(f).ok())
            else {
                continue;
            };
            if size.is_zero() {
                continue;
            }
            let Some(native) = row.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let symbol = Self::canonical_symbol(native);
            if let Some(filter) = symbols {
                if !filter.contains(&symbol) {
                    continue;
                }
            }
            let side = match row.get("side").and_then(|v| v.as_str()) {
                Some("long") => PositionSide::Long,
                Some("short") => PositionSide::Short,
                _ => continue,
            };
            positions.push(Position {
                exchange: "kraken".to_string(),
                symbol,
                side,
                quantity: Size::new(size.abs()),
                entry_price: row
                    .get("price")
                    .and_then(|v| v.as_f64())
                    .and_then(|f| Decimal::try_from(f).ok())
                    .map(Price::new)
                    .unwrap_or(Price(Decimal::ZERO)),
                mark_price: None,
                liquidation_price: None,
                updated_at: Utc::now(),
            });
        }
        Ok(positions)
    }

    async fn fetch_open_orders(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<Vec<Order>, ExchangeError> {
        let json = self
            .signed_request(reqwest::Method::GET, "/api/v3/openorders", Vec::new())
            .await?;

        let rows = json
            .get("openOrders")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::transient("kraken openorders: missing list"))?;

        Ok(rows
            .iter()
            .filter_map(|row| self.parse_open_order(row))
            .filter(|o| symbols.map_or(true, |syms| syms.contains(&o.symbol)))
            .collect())
    }

    async fn place_order(&self, spec: &OrderSpec) -> Result<Order, ExchangeError> {
        let native = self.native_symbol(&spec.symbol)?;
        let mut params = vec![
            (
                "orderType".to_string(),
                match spec.order_type {
                    OrderType::Market => "mkt".to_string(),
                    OrderType::Limit => "lmt".to_string(),
                    OrderType::StopMarket => "stp".to_string(),
                },
            ),
            ("symbol".to_string(), native.to_string()),
            (
                "side".to_string(),
                match spec.side {
                    OrderSide::Buy => "buy".to_string(),
                    OrderSide::Sell => "sell".to_string(),
                },
            ),
            ("size".to_string(), spec.quantity.to_string()),
            ("cliOrdId".to_string(), spec.client_order_id.clone()),
        ];
        if let Some(price) = spec.price {
            params.push(("limitPrice".to_string(), price.to_string()));
        }
        if let Some(trigger) = spec.trigger_price {
            params.push(("stopPrice".to_string(), trigger.to_string()));
        }
        // Kraken futures have no per-order time in force; GTC is implied
        if spec.reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }

        let json = self
            .signed_request(reqwest::Method::POST, "/api/v3/sendorder", params)
            .await
            .map_err(|err| match err {
                ExchangeError::AmbiguousOutcome { message, .. } => {
                    ExchangeError::AmbiguousOutcome {
                        message,
                        client_order_id: Some(spec.client_order_id.clone()),
                    }
                }
                other => other,
            })?;

        let send_status = json
            .get("sendStatus")
            .ok_or_else(|| ExchangeError::transient("kraken sendorder: missing sendStatus"))?;
        let placed = send_status.get("status").and_then(|v| v.as_str());
        if placed != Some("placed") {
            return Err(ExchangeError::rejected(format!(
                "kraken sendorder status {:?}",
                placed
            )));
        }
        let order_id = send_status
            .get("order_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::transient("kraken sendorder: missing order_id"))?;

        Ok(Order {
            id: order_id.to_string(),
            client_order_id: Some(spec.client_order_id.clone()),
            exchange: "kraken".to_string(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            order_type: spec.order_type,
            status: OrderStatus::New,
            quantity: spec.quantity,
            filled_quantity: Size(Decimal::ZERO),
            price: spec.price,
            trigger_price: spec.trigger_price,
            avg_fill_price: None,
            reduce_only: spec.reduce_only,
            created_at: Utc::now(),
            filled_at: None,
        })
    }

    async fn cancel_order(
        &self,
        id: &OrderId,
        _symbol: &Symbol,
    ) -> Result<CancelOutcome, ExchangeError> {
        let params = vec![("order_id".to_string(), id.clone())];
        let json = self
            .signed_request(reqwest::Method::POST, "/api/v3/cancelorder", params)
            .await?;

        match json
            .pointer("/cancelStatus/status")
            .and_then(|v| v.as_str())
        {
            Some("cancelled") => Ok(CancelOutcome::Cancelled),
            Some("filled") => Ok(CancelOutcome::AlreadyTerminal(OrderStatus::Filled)),
            // notFound only says the order left the book, not how; ask for
            // its final status before reporting the terminal state
            Some("notFound") => {
                let params = vec![("orderIds".to_string(), id.clone())];
                match self
                    .signed_request(reqwest::Method::POST, "/api/v3/orders/status", params)
                    .await
                {
                    Ok(json) => {
                        let status = json
                            .get("orders")
                            .and_then(|v| v.as_array())
                            .into_iter()
                            .flatten()
                            .filter_map(|row| row.get("order").or(Some(row)))
                            .filter_map(|row| self.parse_open_order(row))
                            .find(|o| o.id == *id)
                            .map(|o| o.status)
                            .unwrap_or(OrderStatus::Cancelled);
                        Ok(CancelOutcome::AlreadyTerminal(status))
                    }
                    Err(_) => Ok(CancelOutcome::AlreadyTerminal(OrderStatus::Cancelled)),
                }
            }
            other => Err(ExchangeError::rejected(format!(
                "kraken cancelorder status {:?}",
                other
            ))),
        }
    }

    async fn query_order_by_client_id(
        &self,
        client_order_id: &str,
        _symbol: &Symbol,
    ) -> Result<Option<Order>, ExchangeError> {
        let params = vec![("cliOrdIds".to_string(), client_order_id.to_string())];
        let json = self
            .signed_request(reqwest::Method::POST, "/api/v3/orders/status", params)
            .await?;

        let Some(rows) = json.get("orders").and_then(|v| v.as_array()) else {
            return Ok(None);
        };
        Ok(rows
            .iter()
            .filter_map(|row| row.get("order").or(Some(row)))
            .filter_map(|row| self.parse_open_order(row))
            .find(|o| o.client_order_id.as_deref() == Some(client_order_id)))
    }

    fn normalize_symbol(&self, raw: &str) -> Result<Symbol, ExchangeError> {
        let upper = raw.to_uppercase().replace('-', "/");
        SYMBOL_TABLE
            .iter()
            .find(|(canonical, native)| *canonical == upper || *native == upper)
            .map(|(canonical, _)| Symbol::new(*canonical))
            .ok_or_else(|| ExchangeError::UnsupportedSymbol {
                raw: raw.to_string(),
                exchange: "kraken".to_string(),
            })
    }

    fn supports_native_bracket(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_cancel_not_found_resolves_terminal_status_by_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/cancelorder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": "success",
                "cancelStatus": { "status": "notFound" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v3/orders/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": "success",
                "orders": [{ "order": {
                    "order_id": "kf-123",
                    "cliOrdId": "CR_SL_0123456789ab",
                    "symbol": "PF_XBTUSD",
                    "side": "sell",
                    "orderType": "stp",
                    "status": "cancelled",
                    "size": 1.0,
                    "unfilledSize": 1.0,
                    "filledSize": 0.0
                }}]
            })))
            .mount(&server)
            .await;

        let adapter = KrakenAdapter::new("k".to_string(), "c2VjcmV0".to_string(), true)
            .with_rest_url(server.uri());
        let outcome = adapter
            .cancel_order(&"kf-123".to_string(), &Symbol::new("BTC/USD"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::AlreadyTerminal(OrderStatus::Cancelled)
        );
    }

    #[test]
    fn test_demo_url_selection() {
        let adapter = KrakenAdapter::new("k".to_string(), "c2VjcmV0".to_string(), true);
        assert_eq!(adapter.rest_url, "https://demo-futures.kraken.com/derivatives");

        let adapter = KrakenAdapter::new("k".to_string(), "c2VjcmV0".to_string(), false);
        assert_eq!(adapter.rest_url, "https://futures.kraken.com/derivatives");
    }

    #[test]
    fn test_error_string_mapping() {
        assert!(matches!(
            KrakenAdapter::map_error("apiLimitExceeded"),
            ExchangeError::RateLimited { .. }
        ));
        assert!(matches!(
            KrakenAdapter::map_error("authenticationError"),
            ExchangeError::Auth { .. }
        ));
        assert!(matches!(
            KrakenAdapter::map_error("nonceBelowThreshold"),
            ExchangeError::Transient { .. }
        ));
        assert!(matches!(
            KrakenAdapter::map_error("invalidOrder"),
            ExchangeError::Rejected { .. }
        ));
    }

    #[test]
    fn test_normalize_symbol() {
        let adapter = KrakenAdapter::new("k".to_string(), "c2VjcmV0".to_string(), true);
        assert_eq!(
            adapter.normalize_symbol("PF_XBTUSD").unwrap(),
            Symbol::new("BTC/USD")
        );
        assert_eq!(
            adapter.normalize_symbol("btc-usd").unwrap(),
            Symbol::new("BTC/USD")
        );
        assert!(adapter.normalize_symbol("BTCUSDT").is_err());
    }

    #[test]
    fn test_sign_requires_base64_secret() {
        let adapter = KrakenAdapter::new("k".to_string(), "not base64!!".to_string(), true);
        let result = adapter.sign("a=b", "123", "/api/v3/sendorder");
        assert!(matches!(result, Err(ExchangeError::Auth { .. })));

        let adapter = KrakenAdapter::new("k".to_string(), "c2VjcmV0".to_string(), true);
        assert!(adapter.sign("a=b", "123", "/api/v3/sendorder").is_ok());
    }

    #[test]
    fn test_parse_open_order() {
        let adapter = KrakenAdapter::new("k".to_string(), "c2VjcmV0".to_string(), true);
        let row = serde_json::json!({
            "order_id": "kf-123",
            "cliOrdId": "CR_TP_0123456789ab",
            "symbol": "PF_XBTUSD",
            "side": "sell",
            "orderType": "lmt",
            "status": "untouched",
            "size": 0.5,
            "unfilledSize": 0.5,
            "filledSize": 0.0,
            "limitPrice": 52000.0,
            "reduceOnly": true,
            "receivedTime": "2024-01-15T10:00:00.000Z"
        });
        let order = adapter.parse_open_order(&row).unwrap();
        assert_eq!(order.symbol, Symbol::new("BTC/USD"));
        assert_eq!(order.order_type, OrderType::Limit);
        assert_eq!(order.status, OrderStatus::New);
        assert!(order.reduce_only);
    }
}
