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
use serde_json::{json, Value};
use std::time::Duration;

const RECV_WINDOW: &str = "5000";

/// Canonical symbol -> Bybit linear perpetual native spelling
const SYMBOL_TABLE: &[(&str, &str)] = &[
    ("BTC/USDT", "BTCUSDT"),
    ("ETH/USDT", "ETHUSDT"),
    ("SOL/USDT", "SOLUSDT"),
    ("XRP/USDT", "XRPUSDT"),
    ("DOGE/USDT", "DOGEUSDT"),
];

/// Bybit v5 linear perpetuals adapter
pub struct BybitAdapter {
    api_key: String,
    api_secret: String,
    rest_url: String,
    http_client: Client,
}

impl BybitAdapter {
    pub fn new(api_key: String, api_secret: String, testnet: bool) -> Self {
        let rest_url = if testnet {
            "https://api-testnet.bybit.com".to_string()
        } else {
            "https://api.bybit.com".to_string()
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
                exchange: "bybit".to_string(),
            })
    }

    fn canonical_symbol(native: &str) -> Symbol {
        SYMBOL_TABLE
            .iter()
            .find(|(_, n)| *n == native)
            .map(|(canonical, _)| Symbol::new(*canonical))
            .unwrap_or_else(|| Symbol::new(native))
    }

    /// v5 signature: HMAC-SHA256 over timestamp + key + recv_window + payload
    fn sign(&self, timestamp: &str, payload: &str) -> String {
        let prehash = format!("{}{}{}{}", timestamp, self.api_key, RECV_WINDOW, payload);
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(prehash.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn map_ret_code(ret_code: i64, ret_msg: &str) -> ExchangeError {
        match ret_code {
            10006 | 10018 => ExchangeError::RateLimited {
                message: format!("bybit {}: {}", ret_code, ret_msg),
                retry_after: None,
            },
            10002 | 10016 => ExchangeError::transient(format!("bybit {}: {}", ret_code, ret_msg)),
            10003 | 10004 | 10005 | 33004 => ExchangeError::Auth {
                message: format!("bybit {}: {}", ret_code, ret_msg),
            },
            10001 if ret_msg.to_lowercase().contains("symbol") => {
                ExchangeError::UnsupportedSymbol {
                    raw: ret_msg.to_string(),
                    exchange: "bybit".to_string(),
                }
            }
            _ => ExchangeError::rejected(format!("bybit {}: {}", ret_code, ret_msg)),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Value>,
    ) -> Result<Value, ExchangeError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let payload = match &body {
            Some(b) => b.to_string(),
            None => query_string.clone(),
        };
        let signature = self.sign(&timestamp, &payload);

        let url = if query_string.is_empty() {
            format!("{}{}", self.rest_url, path)
        } else {
            format!("{}{}?{}", self.rest_url, path, query_string)
        };

        let mut request = self
            .http_client
            .request(method, &url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature);
        if let Some(b) = body {
            request = request.json(&b);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ExchangeError::RateLimited {
                message: format!("bybit http {}", status),
                retry_after,
            });
        }
        if status.is_server_error() {
            return Err(ExchangeError::transient(format!("bybit http {}", status)));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::transient(format!("bybit response parse: {}", e)))?;

        let ret_code = json.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
        if ret_code != 0 {
            let ret_msg = json.get("retMsg").and_then(|v| v.as_str()).unwrap_or("");
            return Err(Self::map_ret_code(ret_code, ret_msg));
        }
        Ok(json)
    }

    fn parse_status(raw: &str) -> Option<OrderStatus> {
        match raw {
            "New" | "Created" | "Untriggered" => Some(OrderStatus::New),
            "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
            "Filled" => Some(OrderStatus::Filled),
            "Cancelled" | "PartiallyFilledCanceled" => Some(OrderStatus::Cancelled),
            "Rejected" => Some(OrderStatus::Rejected),
            "Deactivated" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    fn parse_order(&self, row: &Value) -> Result<Order, ExchangeError> {
        let parse_err =
            |what: &str| ExchangeError::transient(format!("bybit order parse: missing {}", what));

        let native = row
            .get("symbol")
            .and_then(|v| v.as_str())
            .ok_or_else(|| parse_err("symbol"))?;
        let status_raw = row
            .get("orderStatus")
            .and_then(|v| v.as_str())
            .ok_or_else(|| parse_err("orderStatus"))?;
        let status = Self::parse_status(status_raw)
            .ok_or_else(|| ExchangeError::transient(format!("bybit status '{}'", status_raw)))?;
        let side = match row.get("side").and_then(|v| v.as_str()) {
            Some("Buy") => OrderSide::Buy,
            Some("Sell") => OrderSide::Sell,
            _ => return Err(parse_err("side")),
        };
        let trigger_price = row
            .get("triggerPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| Price::from_str(s).ok())
            .filter(|p| !p.is_zero());
        let order_type = match row.get("orderType").and_then(|v| v.as_str()) {
            Some("Market") if trigger_price.is_some() => OrderType::StopMarket,
            Some("Market") => OrderType::Market,
            Some("Limit") => OrderType::Limit,
            _ => return Err(parse_err("orderType")),
        };

        let quantity = row
            .get("qty")
            .and_then(|v| v.as_str())
            .and_then(|s| Size::from_str(s).ok())
            .ok_or_else(|| parse_err("qty"))?;
        let filled_quantity = row
            .get("cumExecQty")
            .and_then(|v| v.as_str())
            .and_then(|s| Size::from_str(s).ok())
            .unwrap_or(Size(Decimal::ZERO));

        let created_at = row
            .get("createdTime")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        let filled_at = if status == OrderStatus::Filled {
            row.get("updatedTime")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        } else {
            None
        };

        Ok(Order {
            id: row
                .get("orderId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| parse_err("orderId"))?,
            client_order_id: row
                .get("orderLinkId")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
            exchange: "bybit".to_string(),
            symbol: Self::canonical_symbol(native),
            side,
            order_type,
            status,
            quantity,
            filled_quantity,
            price: row
                .get("price")
                .and_then(|v| v.as_str())
                .and_then(|s| Price::from_str(s).ok())
                .filter(|p| !p.is_zero()),
            trigger_price,
            avg_fill_price: row
                .get("avgPrice")
                .and_then(|v| v.as_str())
                .and_then(|s| Price::from_str(s).ok())
                .filter(|p| !p.is_zero()),
            reduce_only: row
                .get("reduceOnly")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            created_at,
            filled_at,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn id(&self) -> ExchangeId {
        "bybit".to_string()
    }

    async fn fetch_positions(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<Vec<Position>, ExchangeError> {
        let mut query = vec![
            ("category".to_string(), "linear".to_string()),
            ("settleCoin".to_string(), "USDT".to_string()),
        ];
        if let Some([symbol]) = symbols {
            query.push(("symbol".to_string(), self.native_symbol(symbol)?.to_string()));
        }
        let json = self
            .request(reqwest::Method::GET, "/v5/position/list", &query, None)
            .await?;

        let rows = json
            .pointer("/result/list")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::transient("bybit position list: missing result"))?;

        let mut positions = Vec::new();
        for row in rows {
            let Some(size) = row
                .get("size")
                .and_then(|v| v.as_str())
                .and_then(|s| Size::from_str(s).ok())
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
                Some("Buy") => PositionSide::Long,
                Some("Sell") => PositionSide::Short,
                _ => continue,
            };
            positions.push(Position {
                exchange: "bybit".to_string(),
                symbol,
                side,
                quantity: size.abs(),
                entry_price: row
                    .get("avgPrice")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Price::from_str(s).ok())
                    .unwrap_or(Price(Decimal::ZERO)),
                mark_price: row
                    .get("markPrice")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Price::from_str(s).ok()),
                liquidation_price: row
                    .get("liqPrice")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Price::from_str(s).ok())
                    .filter(|p| !p.is_zero()),
                updated_at: Utc::now(),
            });
        }
        Ok(positions)
    }

    async fn fetch_open_orders(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<Vec<Order>, ExchangeError> {
        let mut query = vec![
            ("category".to_string(), "linear".to_string()),
            ("settleCoin".to_string(), "USDT".to_string()),
        ];
        if let Some([symbol]) = symbols {
            query.push(("symbol".to_string(), self.native_symbol(symbol)?.to_string()));
        }
        let json = self
            .request(reqwest::Method::GET, "/v5/order/realtime", &query, None)
            .await?;

        let rows = json
            .pointer("/result/list")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::transient("bybit order list: missing result"))?;

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
        let mut body = json!({
            "category": "linear",
            "symbol": native,
            "side": match spec.side {
                OrderSide::Buy => "Buy",
                OrderSide::Sell => "Sell",
            },
            "orderType": match spec.order_type {
                OrderType::Market | OrderType::StopMarket => "Market",
                OrderType::Limit => "Limit",
            },
            "qty": spec.quantity.to_string(),
            "orderLinkId": spec.client_order_id,
            "reduceOnly": spec.reduce_only,
        });
        if let Some(price) = spec.price {
            body["price"] = json!(price.to_string());
            body["timeInForce"] = json!(match spec.time_in_force {
                TimeInForce::Gtc => "GTC",
                TimeInForce::Ioc => "IOC",
                TimeInForce::Fok => "FOK",
            });
        }
        if let Some(trigger) = spec.trigger_price {
            body["triggerPrice"] = json!(trigger.to_string());
            // 1 = triggers when price rises, 2 = when it falls
            body["triggerDirection"] = json!(match spec.side {
                OrderSide::Buy => 1,
                OrderSide::Sell => 2,
            });
        }

        let json = self
            .request(reqwest::Method::POST, "/v5/order/create", &[], Some(body))
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

        // Create only returns the IDs; the order record comes from queries
        let order_id = json
            .pointer("/result/orderId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::transient("bybit create: missing orderId"))?;

        Ok(Order {
            id: order_id.to_string(),
            client_order_id: Some(spec.client_order_id.clone()),
            exchange: "bybit".to_string(),
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
        symbol: &Symbol,
    ) -> Result<CancelOutcome, ExchangeError> {
        let native = self.native_symbol(symbol)?;
        let body = json!({
            "category": "linear",
            "symbol": native,
            "orderId": id,
        });
        match self
            .request(reqwest::Method::POST, "/v5/order/cancel", &[], Some(body))
            .await
        {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            // 110001: order does not exist or is already in a terminal state
            Err(ExchangeError::Rejected { message }) if message.contains("110001") => {
                let query = vec![
                    ("category".to_string(), "linear".to_string()),
                    ("symbol".to_string(), native.to_string()),
                    ("orderId".to_string(), id.clone()),
                ];
                match self
                    .request(reqwest::Method::GET, "/v5/order/realtime", &query, None)
                    .await
                {
                    Ok(json) => {
                        let status = json
                            .pointer("/result/list/0")
                            .and_then(|row| self.parse_order(row).ok())
                            .map(|o| o.status)
                            .unwrap_or(OrderStatus::Cancelled);
                        Ok(CancelOutcome::AlreadyTerminal(status))
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
        let query = vec![
            ("category".to_string(), "linear".to_string()),
            ("symbol".to_string(), native.to_string()),
            ("orderLinkId".to_string(), client_order_id.to_string()),
        ];
        let json = self
            .request(reqwest::Method::GET, "/v5/order/realtime", &query, None)
            .await?;

        match json.pointer("/result/list/0") {
            Some(row) => Ok(Some(self.parse_order(row)?)),
            None => Ok(None),
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
                exchange: "bybit".to_string(),
            })
    }

    fn supports_native_bracket(&self) -> bool {
        true
    }
}
