use crate::config::HttpTimeouts;
use reqwest::Client;

pub fn build_client(timeouts: HttpTimeouts) -> Client {
    Client::builder()
        .timeout(timeouts.request)
        .connect_timeout(timeouts.connect)
        .build()
        .unwrap_or_else(|_| Client::new())
}
