//! Utility functions for ringkv

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let split = if s.ends_with("ms") {
        s.len() - 2
    } else {
        s.len() - s.chars().last().map(|c| c.len_utf8()).unwrap_or(0)
    };
    let (num_str, unit) = s.split_at(split);

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let seconds = |factor: u64| {
        num.checked_mul(factor)
            .map(std::time::Duration::from_secs)
            .ok_or_else(|| crate::Error::InvalidConfig(format!("duration too large: {}", s)))
    };

    match unit {
        "ms" => Ok(std::time::Duration::from_millis(num)),
        "s" => Ok(std::time::Duration::from_secs(num)),
        "m" => seconds(60),
        "h" => seconds(3600),
        _ => Err(crate::Error::InvalidConfig(format!(
            "unknown duration unit: {}",
            unit
        ))),
    }
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt + 1 < max_retries => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Validate a key against the configured limit.
pub fn validate_key(key: &str, max_len: usize) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::EmptyKey);
    }
    if key.len() > max_len {
        return Err(crate::Error::KeyTooLong {
            len: key.len(),
            max: max_len,
        });
    }
    Ok(())
}

/// Validate a value against the configured limit.
pub fn validate_value(value: &str, max_len: usize) -> crate::Result<()> {
    if value.len() > max_len {
        return Err(crate::Error::ValueTooLong {
            len: value.len(),
            max: max_len,
        });
    }
    Ok(())
}
