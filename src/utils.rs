use rand::distributions::Alphanumeric;
use rand::Rng;

pub const XSRF_COOKIE: &str = "XSRF-TOKEN";

/// Generates the 16 character alphanumeric id attached to heartbeat records.
pub fn generate_heartbeat_uid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Normalises a raw `Cookie` string to `a=1; b=2` form.
pub fn normalize_cookies(raw: &str) -> String {
    raw.split(';')
        .map(str::trim)
        .filter(|cookie| !cookie.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Builds the session cookie string from a login response. When the panel
/// sent any `Set-Cookie` headers their `name=value` parts replace the
/// pre-shared cookies outright; otherwise the normalised pre-shared string
/// is kept.
pub fn capture_set_cookies<'a, I>(fallback: &str, set_cookies: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let captured = set_cookies
        .into_iter()
        .filter_map(|header| header.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>();

    if captured.is_empty() {
        normalize_cookies(fallback)
    } else {
        captured.join("; ")
    }
}

/// Pulls the `XSRF-TOKEN` cookie out of a cookie string and URL-decodes it.
/// The cookie name is matched case-sensitively.
pub fn xsrf_token_from_cookies(cookies: &str) -> Option<String> {
    let raw = cookies.split(';').find_map(|cookie| {
        cookie
            .trim()
            .strip_prefix(XSRF_COOKIE)
            .and_then(|rest| rest.strip_prefix('='))
    })?;
    match urlencoding::decode(raw) {
        Ok(decoded) => Some(decoded.into_owned()),
        Err(_) => Some(raw.to_string()),
    }
}
