use chrono::{DateTime, Utc};

use crate::config::TwilioConfig;

/// Twilio REST API client: confirmation SMS plus post-call transcript
/// submission to Conversational Intelligence.
pub struct TwilioClient {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioClient {
    pub fn new(twilio_config: &TwilioConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid: twilio_config.account_sid.clone(),
            auth_token: twilio_config.auth_token.clone(),
            from_number: twilio_config.phone_number.clone(),
        }
    }

    /// Send an SMS from the configured number. Returns the message SID.
    pub async fn send_sms(&self, to: &str, body: &str) -> Result<String, TwilioError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );

        let params = [("To", to), ("From", self.from_number.as_str()), ("Body", body)];

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TwilioError::Api(format!("{status}: {body}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        let sid = body["sid"].as_str().unwrap_or("unknown").to_string();
        tracing::info!(to, message_sid = %sid, "SMS sent");
        Ok(sid)
    }

    /// Submit the call's most recent recording to Conversational
    /// Intelligence for post-call analytics.
    ///
    /// Best effort by contract: the caller logs the error and moves on.
    pub async fn create_transcript(
        &self,
        service_sid: &str,
        call_sid: &str,
        customer_key: Option<&str>,
        media_start_time: DateTime<Utc>,
    ) -> Result<String, TwilioError> {
        let recording_url = self
            .latest_recording_url(call_sid)
            .await?
            .ok_or_else(|| TwilioError::NoRecording(call_sid.to_string()))?;

        let channel = serde_json::json!({
            "media_properties": { "media_url": recording_url }
        })
        .to_string();
        let start_time = media_start_time.to_rfc3339();

        let mut params = vec![
            ("ServiceSid", service_sid.to_string()),
            ("Channel", channel),
            ("MediaStartTime", start_time),
        ];
        if let Some(key) = customer_key {
            params.push(("CustomerKey", key.to_string()));
        }

        let resp = self
            .client
            .post("https://intelligence.twilio.com/v2/Transcripts")
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TwilioError::Api(format!("{status}: {body}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        let sid = body["sid"].as_str().unwrap_or("unknown").to_string();
        tracing::info!(call_sid, transcript_sid = %sid, "CI transcript created");
        Ok(sid)
    }

    /// Media URL of the most recent recording for a call, if any.
    async fn latest_recording_url(
        &self,
        call_sid: &str,
    ) -> Result<Option<String>, TwilioError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Recordings.json",
            self.account_sid
        );

        let resp = self
            .client
            .get(&url)
            .query(&[("CallSid", call_sid), ("PageSize", "1")])
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TwilioError::Api(format!("{status}: {body}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        let uri = body["recordings"]
            .as_array()
            .and_then(|list| list.first())
            .and_then(|rec| rec["uri"].as_str())
            .map(|uri| format!("https://api.twilio.com{}", uri.trim_end_matches(".json")));

        Ok(uri)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TwilioError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Twilio API error: {0}")]
    Api(String),
    #[error("no recording found for call {0}")]
    NoRecording(String),
}
