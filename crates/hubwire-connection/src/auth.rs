//! Access-token hook for authenticating the connection.
//!
//! hubwire doesn't implement authentication itself. The embedding
//! application owns its tokens (JWTs from an identity provider, API keys,
//! whatever the server expects) and hands them over through the
//! [`AccessTokenFactory`] trait.
//!
//! The factory is called once per start (and once per reconnect attempt).
//! The token is sent as `Authorization: Bearer <token>` on HTTP requests
//! and as the `access_token` query parameter on the WebSocket upgrade.
//! If the negotiate response carries its own `accessToken`, that token
//! replaces the factory's for the rest of the attempt.

use std::future::Future;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::ConnectionError;

/// Produces the bearer token for a connection attempt.
///
/// Any `Fn() -> impl Future<Output = Result<String, E>>` closure is a
/// factory, so the common case needs no trait impl:
///
/// ```rust
/// use std::sync::Arc;
/// use hubwire_connection::AccessTokenFactory;
///
/// let factory: Arc<dyn AccessTokenFactory> =
///     Arc::new(|| async { Ok::<_, std::convert::Infallible>("secret".to_string()) });
/// ```
///
/// An empty token means "no token": no header or query parameter is sent.
pub trait AccessTokenFactory: Send + Sync + 'static {
    /// Returns the token to use for the next connection attempt.
    fn access_token(&self) -> BoxFuture<'_, Result<String, ConnectionError>>;
}

impl<F, Fut, E> AccessTokenFactory for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, E>> + Send + 'static,
    E: std::fmt::Display,
{
    fn access_token(&self) -> BoxFuture<'_, Result<String, ConnectionError>> {
        (self)()
            .map(|result| {
                result.map_err(|e| ConnectionError::AccessToken(e.to_string()))
            })
            .boxed()
    }
}
