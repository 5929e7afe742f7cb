//! API channel: one HTTP request per job, built from the provider's templates.

use crate::channels::error::DeliveryError;
use crate::channels::queue::OutboundJob;
use crate::channels::worker::Delivery;
use crate::config::ApiProviderConfig;
use async_trait::async_trait;
use chrono::{Local, SecondsFormat};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            other => Err(format!("unsupported method: {}", other)),
        }
    }
}

/// Values substituted into `{sender}`, `{timestamp}` and `{message}`.
struct Placeholders<'a> {
    sender: &'a str,
    timestamp: &'a str,
    message: &'a str,
}

impl Placeholders<'_> {
    /// Single pass: substituted text is never scanned again, and unknown
    /// `{...}` sequences are left as they are.
    fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let (value, len) = if tail.starts_with("{sender}") {
                (Some(self.sender), "{sender}".len())
            } else if tail.starts_with("{timestamp}") {
                (Some(self.timestamp), "{timestamp}".len())
            } else if tail.starts_with("{message}") {
                (Some(self.message), "{message}".len())
            } else {
                (None, 1)
            };
            match value {
                Some(v) => out.push_str(v),
                None => out.push('{'),
            }
            rest = &tail[len..];
        }
        out.push_str(rest);
        out
    }

    fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.render(s)),
            other => other.clone(),
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct ApiDelivery {
    name: String,
    method: HttpMethod,
    endpoint: String,
    headers: Map<String, Value>,
    payload: Map<String, Value>,
    timeout: Duration,
    client: reqwest::Client,
}

impl ApiDelivery {
    pub fn new(config: &ApiProviderConfig) -> Result<Self, DeliveryError> {
        let method = config
            .method
            .parse()
            .map_err(DeliveryError::Unavailable)?;
        Ok(Self {
            name: config.name.clone(),
            method,
            endpoint: config.endpoint.clone(),
            headers: config.headers.clone(),
            payload: config.payload.clone(),
            timeout: Duration::from_secs(config.timeout),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Delivery for ApiDelivery {
    /// For API channels the job destination is the original sender.
    async fn deliver(&self, job: &OutboundJob) -> Result<(), DeliveryError> {
        let now;
        let timestamp = match job.timestamp.as_deref() {
            Some(ts) => ts,
            None => {
                now = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
                &now
            }
        };
        let vars = Placeholders {
            sender: &job.destination,
            timestamp,
            message: &job.text,
        };

        let url = vars.render(&self.endpoint);
        let mut req = match self.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
        };
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), vars.render(&value_to_string(value)));
        }
        if !self
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("user-agent"))
        {
            req = req.header(
                reqwest::header::USER_AGENT,
                format!("SMS-Gateway/{}", self.name),
            );
        }

        let payload: Map<String, Value> = self
            .payload
            .iter()
            .map(|(k, v)| (k.clone(), vars.render_value(v)))
            .collect();
        req = match self.method {
            HttpMethod::Get if payload.is_empty() => req,
            HttpMethod::Get => {
                let query: Vec<(String, String)> = payload
                    .iter()
                    .map(|(k, v)| (k.clone(), value_to_string(v)))
                    .collect();
                req.query(&query)
            }
            HttpMethod::Post | HttpMethod::Put => req.json(&payload),
        };

        log::debug!("api {}: {:?} {}", self.name, self.method, url);
        let res = req.timeout(self.timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout
            } else {
                DeliveryError::Request(e)
            }
        })?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(DeliveryError::Http {
                status: status.as_u16(),
                body,
            });
        }
        log::info!("api {}: {} answered {}", self.name, url, status.as_u16());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn provider(method: &str, endpoint: String, headers: Value, payload: Value) -> ApiProviderConfig {
        ApiProviderConfig {
            name: "hook".to_string(),
            method: method.to_string(),
            endpoint,
            headers: headers.as_object().cloned().unwrap_or_default(),
            payload: payload.as_object().cloned().unwrap_or_default(),
            timeout: 5,
        }
    }

    fn job() -> OutboundJob {
        OutboundJob::new("+15551234567", "hello {sender}")
            .with_timestamp("2024-07-10T13:28:51+01:00")
    }

    #[test]
    fn placeholders_render_in_a_single_pass() {
        let vars = Placeholders {
            sender: "+1555",
            timestamp: "2024-01-01T00:00:00+00:00",
            message: "{timestamp} literally",
        };
        assert_eq!(
            vars.render("{sender} at {timestamp}: {message} {other}"),
            "+1555 at 2024-01-01T00:00:00+00:00: {timestamp} literally {other}"
        );
        assert_eq!(vars.render("no placeholders {"), "no placeholders {");
    }

    #[test]
    fn method_parsing_is_case_insensitive() {
        assert_eq!("get".parse::<HttpMethod>(), Ok(HttpMethod::Get));
        assert_eq!(" Put ".parse::<HttpMethod>(), Ok(HttpMethod::Put));
        assert!("DELETE".parse::<HttpMethod>().is_err());
    }

    #[tokio::test]
    async fn post_sends_rendered_json_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sms")
            .match_header("x-token", "abc")
            .match_header("user-agent", "SMS-Gateway/hook")
            .match_body(Matcher::Json(json!({
                "from": "+15551234567",
                "at": "2024-07-10T13:28:51+01:00",
                "text": "hello {sender}",
                "priority": 2
            })))
            .with_status(200)
            .create_async()
            .await;

        let delivery = ApiDelivery::new(&provider(
            "POST",
            format!("{}/sms", server.url()),
            json!({"x-token": "abc"}),
            json!({"from": "{sender}", "at": "{timestamp}", "text": "{message}", "priority": 2}),
        ))
        .unwrap();
        delivery.deliver(&job()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn get_sends_payload_as_query_and_keeps_custom_user_agent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/notify/+15551234567")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("msg".into(), "hello {sender}".into()),
                Matcher::UrlEncoded("n".into(), "1".into()),
            ]))
            .match_header("user-agent", "custom/1.0")
            .with_status(204)
            .create_async()
            .await;

        let delivery = ApiDelivery::new(&provider(
            "get",
            format!("{}/notify/{{sender}}", server.url()),
            json!({"User-Agent": "custom/1.0"}),
            json!({"msg": "{message}", "n": 1}),
        ))
        .unwrap();
        delivery.deliver(&job()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_a_retryable_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/sms")
            .with_status(503)
            .with_body("busy")
            .create_async()
            .await;

        let delivery = ApiDelivery::new(&provider(
            "PUT",
            format!("{}/sms", server.url()),
            json!({}),
            json!({"text": "{message}"}),
        ))
        .unwrap();
        let err = delivery.deliver(&job()).await.unwrap_err();
        match &err {
            DeliveryError::Http { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "busy");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_retryable());
        mock.assert_async().await;
    }
}
