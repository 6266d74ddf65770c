use crate::output::print_json;
use stepwise_core::webhook::{sign_payload, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// Print the headers a delivery of `body` at `timestamp` would carry.
/// Defaults to the current time.
pub fn run(secret: &str, timestamp: Option<i64>, body: &str, json: bool) -> anyhow::Result<()> {
    if secret.is_empty() {
        anyhow::bail!("secret must not be empty");
    }
    let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let signature = sign_payload(secret, timestamp, body);

    if json {
        print_json(&serde_json::json!({
            "timestamp": timestamp,
            "signature": signature,
        }))?;
    } else {
        println!("{TIMESTAMP_HEADER}: {timestamp}");
        println!("{SIGNATURE_HEADER}: {signature}");
    }
    Ok(())
}
