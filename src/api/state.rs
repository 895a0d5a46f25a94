use reqwest::Client;

use crate::queue::RequestQueue;

/// Handles shared by every request handler. Both are cheap to clone.
#[derive(Clone, Debug)]
pub struct AppState {
    pub queue: RequestQueue,
    pub client: Client,
}
