use once_cell::sync::Lazy;
use std::env;

pub static API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("CMS_API_ROOT")
        .unwrap_or_else(|_| "https://api.djob.com.br/wp-json/api/v1".to_string())
        .trim_end_matches('/')
        .to_string()
});

pub static CMS_USERNAME: Lazy<String> =
    Lazy::new(|| env::var("CMS_USERNAME").unwrap_or_default());

pub static CMS_PASSWORD: Lazy<String> =
    Lazy::new(|| env::var("CMS_PASSWORD").unwrap_or_default());

/// Bearer tokens issued by the CMS are good for 24 hours unless the auth
/// response says otherwise.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 86_400;

pub fn auth_url() -> String {
    format!("{}/auth", *API_ROOT)
}

pub fn product_by_reference_url(reference: &str) -> String {
    format!("{}/product/{}", *API_ROOT, urlencoding::encode(reference))
}

pub fn create_product_url() -> String {
    format!("{}/product", *API_ROOT)
}

pub fn update_product_url(id: u64) -> String {
    format!("{}/product/{id}", *API_ROOT)
}

pub fn statistics_url() -> String {
    format!("{}/statistics", *API_ROOT)
}
