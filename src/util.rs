use std::sync::Mutex;

use http::Uri;
use http::header::{HeaderName, HeaderValue};

use crate::error::Error;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn is_https_scheme(scheme: &str) -> bool {
    scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss")
}

pub(crate) fn default_port(uri: &Uri) -> Option<u16> {
    uri.port_u16().or_else(|| {
        let scheme = uri.scheme_str()?;
        if is_https_scheme(scheme) {
            Some(443)
        } else if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("ws") {
            Some(80)
        } else {
            None
        }
    })
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|_| Error::InvalidHeaderName {
        name: name.to_owned(),
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|_| Error::InvalidHeaderValue {
        name: name.to_owned(),
    })
}

pub(crate) fn append_query_pairs(uri: &str, query_pairs: &[(String, String)]) -> String {
    if query_pairs.is_empty() {
        return uri.to_owned();
    }
    let Ok(mut url) = url::Url::parse(uri) else {
        return uri.to_owned();
    };
    url.query_pairs_mut()
        .extend_pairs(query_pairs.iter().map(|(name, value)| (name, value)));
    url.to_string()
}

/// Drops credentials, query and fragment so the uri can be logged.
pub(crate) fn redact_uri_for_logs(uri: &Uri) -> String {
    let scheme = uri.scheme_str().unwrap_or("http");
    let Some(host) = uri.host() else {
        return uri.path().to_owned();
    };
    match uri.port_u16() {
        Some(port) => format!("{scheme}://{host}:{port}{}", uri.path()),
        None => format!("{scheme}://{host}{}", uri.path()),
    }
}
