//! Navigation routes that carry pairing bootstrap parameters.
//!
//! The presentation layer hands pairing parameters around as route strings:
//!
//! ```text
//! pair_device/<productId>/<deviceId>?password=<password>&sct=<sct>&
//! app_device_page/<productId>/<deviceId>
//! ```
//!
//! Query parameters with an empty value are left out entirely, so a device
//! that advertises no password produces `pair_device/<p>/<d>`.  Values are
//! plain tokens; they are not percent-encoded and must not contain `/`, `?`,
//! `&` or `=`.

use std::fmt;

use thiserror::Error;

use super::device::DeviceKey;

const PAIR_DEVICE_ROOT: &str = "pair_device";
const DEVICE_PAGE_ROOT: &str = "app_device_page";

/// Errors produced when parsing a route string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("unknown route root {0:?}")]
    UnknownRoot(String),
    #[error("route must name both a product id and a device id")]
    MissingSegment,
    #[error("unexpected extra path segment {0:?}")]
    ExtraSegment(String),
    #[error("malformed query parameter {0:?}")]
    MalformedQuery(String),
    #[error("unknown query parameter {0:?}")]
    UnknownParameter(String),
}

/// Bootstrap parameters for pairing with one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRoute {
    pub key: DeviceKey,
    pub password: Option<String>,
    pub sct: Option<String>,
}

impl PairingRoute {
    pub fn new(key: DeviceKey) -> Self {
        Self {
            key,
            password: None,
            sct: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = non_empty(password.into());
        self
    }

    pub fn with_sct(mut self, sct: impl Into<String>) -> Self {
        self.sct = non_empty(sct.into());
        self
    }

    /// Parses `pair_device/<productId>/<deviceId>[?query]`.
    ///
    /// # Errors
    ///
    /// Returns a [`RouteError`] describing the first malformed part.
    pub fn parse(route: &str) -> Result<Self, RouteError> {
        let (path, query) = match route.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (route, None),
        };

        let key = parse_device_path(path, PAIR_DEVICE_ROOT)?;
        let mut parsed = Self::new(key);

        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| RouteError::MalformedQuery(pair.to_string()))?;
            match name {
                "password" => parsed.password = non_empty(value.to_string()),
                "sct" => parsed.sct = non_empty(value.to_string()),
                other => return Err(RouteError::UnknownParameter(other.to_string())),
            }
        }

        Ok(parsed)
    }
}

impl fmt::Display for PairingRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PAIR_DEVICE_ROOT}/{}/{}",
            self.key.product_id, self.key.device_id
        )?;
        let params: Vec<(&str, &str)> = [("password", &self.password), ("sct", &self.sct)]
            .into_iter()
            .filter_map(|(name, value)| value.as_deref().map(|v| (name, v)))
            .collect();
        if !params.is_empty() {
            f.write_str("?")?;
            for (name, value) in params {
                write!(f, "{name}={value}&")?;
            }
        }
        Ok(())
    }
}

/// Route of the page showing one paired device.
pub fn device_page_route(key: &DeviceKey) -> String {
    format!("{DEVICE_PAGE_ROOT}/{}/{}", key.product_id, key.device_id)
}

/// Parses `app_device_page/<productId>/<deviceId>`.
///
/// # Errors
///
/// Returns a [`RouteError`] when the root or segments are wrong.
pub fn parse_device_page_route(route: &str) -> Result<DeviceKey, RouteError> {
    parse_device_path(route, DEVICE_PAGE_ROOT)
}

fn parse_device_path(path: &str, expected_root: &str) -> Result<DeviceKey, RouteError> {
    let mut segments = path.split('/');
    let root = segments.next().unwrap_or_default();
    if root != expected_root {
        return Err(RouteError::UnknownRoot(root.to_string()));
    }
    let product = segments.next().filter(|s| !s.is_empty());
    let device = segments.next().filter(|s| !s.is_empty());
    let (Some(product), Some(device)) = (product, device) else {
        return Err(RouteError::MissingSegment);
    };
    if let Some(extra) = segments.next() {
        return Err(RouteError::ExtraSegment(extra.to_string()));
    }
    Ok(DeviceKey::new(product, device))
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}
