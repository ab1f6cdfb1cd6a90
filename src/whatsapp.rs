use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::error::EngineError;
use crate::types::AppState;

struct TwilioCreds {
    account_sid: String,
    auth_token: String,
    from_number: String,
}

fn twilio_creds() -> Result<TwilioCreds, EngineError> {
    let account_sid = std::env::var("TWILIO_ACCOUNT_SID").unwrap_or_default();
    let auth_token = std::env::var("TWILIO_AUTH_TOKEN").unwrap_or_default();
    let from_number = std::env::var("TWILIO_WHATSAPP_FROM").unwrap_or_default();
    if account_sid.trim().is_empty() || auth_token.trim().is_empty() {
        return Err(EngineError::Delivery(
            "whatsapp credentials not configured".to_string(),
        ));
    }
    Ok(TwilioCreds {
        account_sid,
        auth_token,
        from_number,
    })
}

/// Normalizes a phone number into the `whatsapp:+E164` form the API expects.
/// Numbers without a country code default to +1.
pub fn normalize_whatsapp_number(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("whatsapp:") {
        return trimmed.to_string();
    }
    let mut digits: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if !digits.starts_with('+') {
        if let Some(rest) = digits.strip_prefix("00") {
            digits = format!("+{rest}");
        } else {
            digits = format!("+1{digits}");
        }
    }
    format!("whatsapp:{digits}")
}

/// Sends a pre-approved content template and returns the external message id
/// used to correlate inbound webhook replies.
pub async fn send_template(
    state: &AppState,
    number: &str,
    content_sid: &str,
    variables: &Value,
) -> Result<String, EngineError> {
    let creds = twilio_creds()?;
    if content_sid.trim().is_empty() {
        return Err(EngineError::Delivery(
            "whatsapp handover content sid not configured".to_string(),
        ));
    }

    let to = normalize_whatsapp_number(number);
    let content_variables = serde_json::to_string(variables).unwrap_or_else(|_| "{}".to_string());
    let form = [
        ("To", to.as_str()),
        ("From", creds.from_number.as_str()),
        ("ContentSid", content_sid),
        ("ContentVariables", content_variables.as_str()),
    ];

    post_message(state, &creds, &form).await
}

/// Free-form text send used for visitor-message forwarding and agent
/// reminders once the 24h session window is open.
pub async fn send_text(state: &AppState, number: &str, text: &str) -> Result<String, EngineError> {
    let creds = twilio_creds()?;
    let to = normalize_whatsapp_number(number);
    let form = [
        ("To", to.as_str()),
        ("From", creds.from_number.as_str()),
        ("Body", text),
    ];

    post_message(state, &creds, &form).await
}

async fn post_message(
    state: &AppState,
    creds: &TwilioCreds,
    form: &[(&str, &str)],
) -> Result<String, EngineError> {
    let url = format!(
        "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
        creds.account_sid
    );
    let response = state
        .http_client
        .post(&url)
        .basic_auth(&creds.account_sid, Some(&creds.auth_token))
        .form(form)
        .send()
        .await
        .map_err(|err| EngineError::Delivery(format!("whatsapp request failed: {err}")))?;

    let status = response.status();
    let body = response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| json!({}));
    if !status.is_success() {
        let detail = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(EngineError::Delivery(format!(
            "whatsapp send returned {status}: {detail}"
        )));
    }

    let sid = body
        .get("sid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if sid.is_empty() {
        return Err(EngineError::Delivery(
            "whatsapp send response had no message sid".to_string(),
        ));
    }
    Ok(sid)
}

/// HMAC-SHA256 webhook signature check. An empty configured secret disables
/// verification (development mode).
pub fn verify_webhook_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_and_international_numbers() {
        assert_eq!(
            normalize_whatsapp_number("(555) 123-4567"),
            "whatsapp:+15551234567"
        );
        assert_eq!(
            normalize_whatsapp_number("+44 7700 900123"),
            "whatsapp:+447700900123"
        );
        assert_eq!(
            normalize_whatsapp_number("0044 7700 900123"),
            "whatsapp:+447700900123"
        );
        assert_eq!(
            normalize_whatsapp_number("whatsapp:+15551234567"),
            "whatsapp:+15551234567"
        );
    }

    #[test]
    fn signature_verification_round_trip() {
        let secret = "topsecret";
        let body = b"{\"externalMessageId\":\"SM1\",\"text\":\"hi\"}";

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verify_webhook_signature(
            secret,
            Some(&format!("sha256={signature}")),
            body
        ));
        assert!(!verify_webhook_signature(secret, Some("sha256=deadbeef"), body));
        assert!(!verify_webhook_signature(secret, None, body));
        // Empty secret disables verification.
        assert!(verify_webhook_signature("", None, body));
    }
}
