//! Providers every server registers.

use super::provider::{Provider, Reply};
use replicad_proto::Value;

pub const SERVER_MODULE: &str = "server";
pub const GET_SERVER_TIME: u32 = 1;

/// `server` module: method 1 `GetServerTime` answers with the server's
/// wall clock in milliseconds since the epoch.
pub fn server_provider() -> Provider {
    Provider::builder(SERVER_MODULE)
        .method(GET_SERVER_TIME, "GetServerTime", |_ctx, _args| {
            Ok(Reply::Done(vec![Value::Int(
                chrono::Utc::now().timestamp_millis(),
            )]))
        })
        .build()
}
