use crate::core::{
    ExchangeId, Order, OrderId, OrderSide, OrderStatus, OrderType, Position, PositionSide,
    TimeInForce,
};
use crate::exchanges::{CancelOutcome, ExchangeAdapter, ExchangeError, OrderSpec};
use crate::types::{Price, Size, Symbol};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;

/// Canonical symbol -> Binance USD-M futures native spelling
const SYMBOL_TABLE: &[(&str, &str)] = &[
    ("BTC/USDT", "BTCUSDT"),
    ("ETH/USDT", "ETHUSDT"),
    ("SOL/USDT", "SOLUSDT"),
    ("XRP/USDT", "XRPUSDT"),
    ("DOGE/USDT", "DOGEUSDT"),
];

/// Binance USD-M futures adapter
pub struct BinanceAdapter {
    api_key: String,
    api_secret: String,
    rest_url: String,
    http_client: Client,
}

impl BinanceAdapter {
    pub fn new(api_key: String, api_secret: String, testnet: bool) -> Self {
        let rest_url = if testnet {
            "https://testnet.binancefuture.com".to_string()
        } else {
            "https://fapi.binance.com".to_string()
        };

        Self {
            api_key,
            api_secret,
            rest_url,
            http_client: Client::new(),
        }
    }

    /// Point the adapter at a different REST endpoint (HTTP test servers)
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
                exchange: "binance".to_string(),
            })
    }

    fn canonical_symbol(native: &str) -> Symbol {
        SYMBOL_TABLE
            .iter()
            .find(|(_, n)| *n == native)
            .map(|(canonical, _)| Symbol::new(*canonical))
            .unwrap_or_else(|| Symbol::new(native))
    }

    /// Generate signature for API request
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Map a Binance error code to the shared taxonomy
    fn map_error(code: i64, msg: &str) -> ExchangeError {
        match code {
            -1003 | -1015 => ExchangeError::RateLimited {
                message: format!("binance {}: {}", code, msg),
                retry_after: None,
            },
            -1021 | -1001 => ExchangeError::transient(format!("binance {}: {}", code, msg)),
            -2015 | -2014 | -1022 => ExchangeError::Auth {
                message: format!("binance {}: {}", code, msg),
            },
            -1121 => ExchangeError::UnsupportedSymbol {
                raw: msg.to_string(),
                exchange: "binance".to_string(),
            },
            _ => ExchangeError::rejected(format!("binance {}: {}", code, msg)),
        }
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<Value, ExchangeError> {
        params.push((
            "timestamp".to_string(),
            Utc::now().timestamp_millis().to_string(),
        ));

        let query_string = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query_string);
        let signed_query = format!("{}&signature={}", query_string, signature);

        let url = format!("{}{}?{}", self.rest_url, path, signed_query);
        let response = self
            .http_client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::RateLimited {
                message: format!("binance {}: {}", status, body),
                retry_after,
            });
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::transient(format!(
                "binance {}: {}",
                status, body
            )));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::transient(format!("binance response parse: {}", e)))?;

        if let Some(code) = json.get("code").and_then(|v| v.as_i64()) {
            if code != 0 && code != 200 {
                let msg = json.get("msg").and_then(|v| v.as_str()).unwrap_or("");
                return Err(Self::map_error(code, msg));
            }
        }
        if !status.is_success() {
            return Err(ExchangeError::rejected(format!("binance {}", status)));
        }

        Ok(json)
    }

    fn parse_status(raw: &str) -> Option<OrderStatus> {
        match raw {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" => Some(OrderStatus::Cancelled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    fn parse_order(&self, json: &Value) -> Result<Order, ExchangeError> {
        let parse_err =
            |what: &str| ExchangeError::transient(format!("binance order parse: missing {}", what));

        let native = json
            .get("symbol")
            .and_then(|v| v.as_str())
            .ok_or_else(|| parse_err("symbol"))?;
        let status_raw = json
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| parse_err("status"))?;
        let status = Self::parse_status(status_raw)
            .ok_or_else(|| ExchangeError::transient(format!("binance status '{}'", status_raw)))?;
        let side = match json.get("side").and_then(|v| v.as_str()) {
            Some("BUY") => OrderSide::Buy,
            Some("SELL") => OrderSide::Sell,
            _ => return Err(parse_err("side")),
        };
        let order_type = match json.get("type").and_then(|v| v.as_str()) {
            Some("MARKET") => OrderType::Market,
            Some("LIMIT") => OrderType::Limit,
            Some("STOP_MARKET") | Some("STOP") => OrderType::StopMarket,
            _ => return Err(parse_err("type")),
        };

        let quantity = json
            .get("origQty")
            .and_then(|v| v.as_str())
            .and_then(|s| Size::from_str(s).ok())
            .ok_or_else(|| parse_err("origQty"))?;
        let filled_quantity = json
            .get("executedQty")
            .and_then(|v| v.as_str())
            .and_then(|s| Size::from_str(s).ok())
            .unwrap_or(Size(Decimal::ZERO));
        let price = json
            .get("price")
            .and_then(|v| v.as_str())
            .and_then(|s| Price::from_str(s).ok())
            .filter(|p| !p.is_zero());
        let trigger_price = json
            .get("stopPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| Price::from_str(s).ok())
            .filter(|p| !p.is_zero());
        let avg_fill_price = json
            .get("avgPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| Price::from_str(s).ok())
            .filter(|p| !p.is_zero());

        let created_ms = json
            .get("time")
            .or_else(|| json.get("updateTime"))
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let created_at = Utc
            .timestamp_millis_opt(created_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let filled_at = if status == OrderStatus::Filled {
            json.get("updateTime")
                .and_then(|v| v.as_i64())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        } else {
            None
        };

        Ok(Order {
            id: json
                .get("orderId")
                .and_then(|v| v.as_i64())
                .map(|id| id.to_string())
                .ok_or_else(|| parse_err("orderId"))?,
            client_order_id: json
                .get("clientOrderId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            exchange: "binance".to_string(),
            symbol: Self::canonical_symbol(native),
            side,
            order_type,
            status,
            quantity,
            filled_quantity,
            price,
            trigger_price,
            avg_fill_price,
            reduce_only: json
                .get("reduceOnly")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            created_at,
            filled_at,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn id(&self) -> ExchangeId {
        "binance".to_string()
    }

    async fn fetch_positions(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<Vec<Position>, ExchangeError> {
        let json = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;

        let rows = json
            .as_array()
            .ok_or_else(|| ExchangeError::transient("binance positionRisk: not an array"))?;

        let mut positions = Vec::new();
        for row in rows {
            let Some(amt) = row
                .get("positionAmt")
                .and_then(|v| v.as_str())
                .and_then(|s| Size::from_str(s).ok())
            else {
                continue;
            };
            if amt.is_zero() {
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
            let side = if amt.value() > Decimal::ZERO {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            let entry_price = row
                .get("entryPrice")
                .and_then(|v| v.as_str())
                .and_then(|s| Price::from_str(s).ok())
                .unwrap_or(Price(Decimal::ZERO));
            let mark_price = row
                .get("markPrice")
                .and_then(|v| v.as_str())
                .and_then(|s| Price::from_str(s).ok());
            let liquidation_price = row
                .get("liquidationPrice")
                .and_then(|v| v.as_str())
                .and_then(|s| Price::from_str(s).ok())
                .filter(|p| !p.is_zero());

            positions.push(Position {
                exchange: "binance".to_string(),
                symbol,
                side,
                quantity: amt.abs(),
                entry_price,
                mark_price,
                liquidation_price,
                updated_at: Utc::now(),
            });
        }
        Ok(positions)
    }

    async fn fetch_open_orders(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<Vec<Order>, ExchangeError> {
        let mut params = Vec::new();
        // One-symbol filters go to the venue; wider filters apply locally
        if let Some([symbol]) = symbols {
            params.push(("symbol".to_string(), self.native_symbol(symbol)?.to_string()));
        }
        let json = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/openOrders", params)
            .await?;

        let rows = json
            .as_array()
            .ok_or_else(|| ExchangeError::transient("binance openOrders: not an array"))?;

        let mut orders = Vec::new();
        for row in rows {
            let order = self.parse_order(row)?;
            if let Some(filter) = symbols {
                if !filter.contains(&order.symbol) {
                    continue;
                }
            }
            orders.push(order);
        }
        Ok(orders)
    }

    async fn place_order(&self, spec: &OrderSpec) -> Result<Order, ExchangeError> {
        let native = self.native_symbol(&spec.symbol)?;
        let mut params = vec![
            ("symbol".to_string(), native.to_string()),
            ("side".to_string(), spec.side.to_string()),
            (
                "type".to_string(),
                match spec.order_type {
                    OrderType::Market => "MARKET".to_string(),
                    OrderType::Limit => "LIMIT".to_string(),
                    OrderType::StopMarket => "STOP_MARKET".to_string(),
                },
            ),
            ("quantity".to_string(), spec.quantity.to_string()),
            ("newClientOrderId".to_string(), spec.client_order_id.clone()),
            ("newOrderRespType".to_string(), "RESULT".to_string()),
        ];
        if let Some(price) = spec.price {
            params.push(("price".to_string(), price.to_string()));
        }
        if let Some(trigger) = spec.trigger_price {
            params.push(("stopPrice".to_string(), trigger.to_string()));
        }
        if spec.order_type == OrderType::Limit {
            params.push((
                "timeInForce".to_string(),
                match spec.time_in_force {
                    TimeInForce::Gtc => "GTC".to_string(),
                    TimeInForce::Ioc => "IOC".to_string(),
                    TimeInForce::Fok => "FOK".to_string(),
                },
            ));
        }
        if spec.reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }

        let json = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", params)
            .await
            .map_err(|err| match err {
                // The request may have been accepted before the line dropped
                ExchangeError::AmbiguousOutcome { message, .. } => {
                    ExchangeError::AmbiguousOutcome {
                        message,
                        client_order_id: Some(spec.client_order_id.clone()),
                    }
                }
                other => other,
            })?;
        self.parse_order(&json)
    }

    async fn cancel_order(
        &self,
        id: &OrderId,
        symbol: &Symbol,
    ) -> Result<CancelOutcome, ExchangeError> {
        let native = self.native_symbol(symbol)?;
        let params = vec![
            ("symbol".to_string(), native.to_string()),
            ("orderId".to_string(), id.clone()),
        ];
        match self
            .signed_request(reqwest::Method::DELETE, "/fapi/v1/order", params)
            .await
        {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            // -2011 "Unknown order sent": the order already reached a
            // terminal state; find out which one
            Err(ExchangeError::Rejected { message })
                if message.contains("-2011") || message.contains("-2013") =>
            {
                let params = vec![
                    ("symbol".to_string(), native.to_string()),
                    ("orderId".to_string(), id.clone()),
                ];
                match self
                    .signed_request(reqwest::Method::GET, "/fapi/v1/order", params)
                    .await
                {
                    Ok(json) => {
                        let order = self.parse_order(&json)?;
                        Ok(CancelOutcome::AlreadyTerminal(order.status))
                    }
                    Err(_) => Ok(CancelOutcome::AlreadyTerminal(OrderStatus::Cancelled)),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn query_order_by_client_id(
        &self,
        client_order_id: &str,
        symbol: &Symbol,
    ) -> Result<Option<Order>, ExchangeError> {
        let native = self.native_symbol(symbol)?;
        let params = vec![
            ("symbol".to_string(), native.to_string()),
            (
                "origClientOrderId".to_string(),
                client_order_id.to_string(),
            ),
        ];
        match self
            .signed_request(reqwest::Method::GET, "/fapi/v1/order", params)
            .await
        {
            Ok(json) => Ok(Some(self.parse_order(&json)?)),
            Err(ExchangeError::Rejected { message }) if message.contains("-2013") => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn normalize_symbol(&self, raw: &str) -> Result<Symbol, ExchangeError> {
        let upper = raw.to_uppercase().replace('-', "/");
        SYMBOL_TABLE
            .iter()
            .find(|(canonical, native)| *canonical == upper || *native == upper)
            .map(|(canonical, _)| Symbol::new(*canonical))
            .ok_or_else(|| ExchangeError::UnsupportedSymbol {
                raw: raw.to_string(),
                exchange: "binance".to_string(),
            })
    }

    fn supports_native_bracket(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> BinanceAdapter {
        BinanceAdapter::new("test_key".to_string(), "test_secret".to_string(), true)
            .with_rest_url(server.uri())
    }

    #[test]
    fn test_testnet_url_selection() {
        let adapter = BinanceAdapter::new("k".to_string(), "s".to_string(), true);
        assert_eq!(adapter.rest_url, "https://testnet.binancefuture.com");

        let adapter = BinanceAdapter::new("k".to_string(), "s".to_string(), false);
        assert_eq!(adapter.rest_url, "https://fapi.binance.com");
    }

    #[test]
    fn test_normalize_symbol_accepts_both_spellings() {
        let adapter = BinanceAdapter::new("k".to_string(), "s".to_string(), true);
        assert_eq!(
            adapter.normalize_symbol("BTCUSDT").unwrap(),
            Symbol::new("BTC/USDT")
        );
        assert_eq!(
            adapter.normalize_symbol("btc/usdt").unwrap(),
            Symbol::new("BTC/USDT")
        );
        assert!(matches!(
            adapter.normalize_symbol("PEPE_OTC"),
            Err(ExchangeError::UnsupportedSymbol { .. })
        ));
    }

    #[test]
    fn test_error_code_mapping() {
        assert!(matches!(
            BinanceAdapter::map_error(-1003, "too many requests"),
            ExchangeError::RateLimited { .. }
        ));
        assert!(matches!(
            BinanceAdapter::map_error(-2015, "invalid api key"),
            ExchangeError::Auth { .. }
        ));
        assert!(matches!(
            BinanceAdapter::map_error(-2011, "unknown order sent"),
            ExchangeError::Rejected { .. }
        ));
        assert!(matches!(
            BinanceAdapter::map_error(-1021, "timestamp out of recv window"),
            ExchangeError::Transient { .. }
        ));
    }

    #[tokio::test]
    async fn test_fetch_positions_skips_flat_symbols() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "symbol": "BTCUSDT",
                    "positionAmt": "0.500",
                    "entryPrice": "50000.0",
                    "markPrice": "50100.0",
                    "liquidationPrice": "41000.0"
                },
                {
                    "symbol": "ETHUSDT",
                    "positionAmt": "0.000",
                    "entryPrice": "0.0",
                    "markPrice": "3000.0",
                    "liquidationPrice": "0"
                }
            ])))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let positions = adapter.fetch_positions(None).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, Symbol::new("BTC/USDT"));
        assert_eq!(positions[0].side, PositionSide::Long);
        assert_eq!(positions[0].quantity, Size::from_str("0.500").unwrap());
    }

    #[tokio::test]
    async fn test_rate_limit_response_carries_retry_hint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "3")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let err = adapter.fetch_positions(None).await.unwrap_err();
        match err {
            ExchangeError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
            }
            other => panic!("expected rate limit, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_venue_error_body_maps_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": -2015,
                "msg": "Invalid API-key, IP, or permissions for action."
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let err = adapter.fetch_positions(None).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Auth { .. }));
    }

    #[tokio::test]
    async fn test_query_unknown_client_id_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -2013,
                "msg": "Order does not exist."
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let result = adapter
            .query_order_by_client_id("CR_ENTRY_missing", &Symbol::new("BTC/USDT"))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
