//! HTTP Basic authentication (RFC 2617 §2).

/// Decode `base64(user:password)` authorization details.
pub(crate) fn decode(details: &str) -> Option<(String, String)> {
    let decoded = base64::decode(details.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    match decoded.find(':') {
        Some(i) => Some((decoded[..i].to_string(), decoded[i + 1..].to_string())),
        None => Some((decoded, String::new())),
    }
}

/// Encode the client `Authorization` header value.
pub(crate) fn header_value(user: &str, password: &str) -> String {
    format!("Basic {}", base64::encode(format!("{}:{}", user, password)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_round_trip() {
        let value = header_value("joe", "secret");
        let details = value.strip_prefix("Basic ").unwrap();
        assert_eq!(
            decode(details),
            Some(("joe".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn decode_without_colon() {
        let details = base64::encode("joe");
        assert_eq!(decode(&details), Some(("joe".to_string(), String::new())));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert_eq!(decode("!!!"), None);
    }
}
