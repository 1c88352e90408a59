use serde::Deserialize;

use crate::config::CarrierConfig;
use crate::error::{Error, Result};

/// REST client for the carrier's call control API. Stateless beyond the
/// account credentials; safe to call from any task.
#[derive(Clone)]
pub struct CarrierRest {
    client: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
    #[serde(default)]
    status: String,
}

/// An in-progress call as the carrier reports it.
#[derive(Clone, Debug, Deserialize)]
pub struct RemoteCall {
    pub sid: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "from")]
    pub from_number: String,
    #[serde(default, rename = "to")]
    pub to_number: String,
    #[serde(default)]
    pub direction: String,
}

#[derive(Debug, Deserialize)]
struct CallPage {
    #[serde(default)]
    calls: Vec<RemoteCall>,
}

impl CarrierRest {
    pub fn new(config: &CarrierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            account_sid: config.sid.clone(),
            auth_token: config.token.clone(),
            from_number: config.from_number.clone(),
        }
    }

    pub fn from_number(&self) -> &str {
        &self.from_number
    }

    fn calls_url(&self) -> String {
        format!("{}/Accounts/{}/Calls.json", self.api_base, self.account_sid)
    }

    fn call_url(&self, call_sid: &str) -> String {
        format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.api_base, self.account_sid, call_sid
        )
    }

    /// Place an outbound call. The webhook URL must answer with stream
    /// connection instructions. Returns the carrier's call sid.
    pub async fn dial(
        &self,
        to_number: &str,
        webhook_url: &str,
        status_callback_url: &str,
    ) -> Result<String> {
        let params = [
            ("To", to_number),
            ("From", self.from_number.as_str()),
            ("Url", webhook_url),
            ("Method", "POST"),
            ("StatusCallback", status_callback_url),
            ("StatusCallbackMethod", "POST"),
            ("Timeout", "30"),
        ];
        let response = self
            .client
            .post(self.calls_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::CarrierApi(format!("dial failed: {} {}", status, body)));
        }
        let call: CallResource = response.json().await?;
        tracing::info!("Call initiated: {} ({})", call.sid, call.status);
        Ok(call.sid)
    }

    /// Calls the carrier currently reports as in progress.
    pub async fn list_active_calls(&self) -> Result<Vec<RemoteCall>> {
        let response = self
            .client
            .get(self.calls_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .query(&[("Status", "in-progress")])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::CarrierApi(format!("list calls failed: {}", status)));
        }
        let page: CallPage = response.json().await?;
        Ok(page.calls)
    }

    /// Hang up an active call by forcing it to the completed state.
    pub async fn end_call(&self, call_sid: &str) -> Result<()> {
        let response = self
            .client
            .post(self.call_url(call_sid))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::CarrierApi(format!(
                "end call {} failed: {}",
                call_sid, status
            )));
        }
        tracing::info!("Ended call {}", call_sid);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> CarrierConfig {
        CarrierConfig {
            sid: "AC1".to_string(),
            token: "tok".to_string(),
            from_number: "+15550100".to_string(),
            api_base: "https://carrier.example/2010-04-01/".to_string(),
        }
    }

    #[test]
    fn parses_a_call_page() {
        let raw = r#"{"calls":[
            {"sid":"CA1","status":"in-progress","from":"+15550100","to":"+15550199","direction":"outbound-api"},
            {"sid":"CA2","status":"in-progress","from":"+15550101","to":"+15550199"}
        ]}"#;
        let page: CallPage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.calls.len(), 2);
        assert_eq!(page.calls[0].sid, "CA1");
        assert_eq!(page.calls[0].from_number, "+15550100");
        assert_eq!(page.calls[1].direction, "");
    }

    #[test]
    fn builds_call_urls() {
        let rest = CarrierRest::new(&config());
        assert_eq!(
            rest.calls_url(),
            "https://carrier.example/2010-04-01/Accounts/AC1/Calls.json"
        );
        assert_eq!(
            rest.call_url("CA9"),
            "https://carrier.example/2010-04-01/Accounts/AC1/Calls/CA9.json"
        );
    }
}
