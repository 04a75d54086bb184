// Client core: the pieces a front end builds on. The state store owns
// conversation state and the streaming buffer; the API client is the one
// error-normalizing path to the server.

pub mod api;
pub mod prefs;
pub mod session;

pub use api::ApiClient;
pub use prefs::ClientPrefs;
pub use session::ChatStore;
