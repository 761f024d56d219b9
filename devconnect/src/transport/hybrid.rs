//! Hybrid connector with transparent fallback.
//!
//! [`HybridConnector`] wraps a preferred and a fallback [`Connector`]. Each
//! connection attempt (including every reconnect) tries the preferred
//! connector first and falls back to the secondary one if that fails, so a
//! client that lost its WebSocket can come back over long-polling and vice
//! versa.
//!
//! The result is a [`HybridTransport`], which delegates every call to
//! whichever transport was established.

use super::{Connector, Transport, TransportError, TransportType};

/// Connector that tries a preferred connector, then a fallback.
///
/// # Type Parameters
///
/// - `P`: The preferred connector (e.g., WebSocket).
/// - `F`: The fallback connector (e.g., long-polling).
pub struct HybridConnector<P: Connector, F: Connector> {
    preferred: P,
    fallback: F,
}

impl<P: Connector, F: Connector> HybridConnector<P, F> {
    /// Create a hybrid connector from a preferred and a fallback connector.
    #[must_use]
    pub const fn new(preferred: P, fallback: F) -> Self {
        Self {
            preferred,
            fallback,
        }
    }

    /// Return a reference to the preferred connector.
    pub const fn preferred(&self) -> &P {
        &self.preferred
    }

    /// Return a reference to the fallback connector.
    pub const fn fallback(&self) -> &F {
        &self.fallback
    }
}

impl<P: Connector, F: Connector> Connector for HybridConnector<P, F> {
    type Transport = HybridTransport<P::Transport, F::Transport>;

    /// Connect with the preferred connector, falling back on failure.
    ///
    /// # Errors
    ///
    /// Returns the fallback connector's error when both attempts fail.
    async fn connect(&self) -> Result<Self::Transport, TransportError> {
        match self.preferred.connect().await {
            Ok(transport) => return Ok(HybridTransport::Preferred(transport)),
            Err(e) => {
                tracing::warn!(err = %e, "preferred transport failed, trying fallback");
            }
        }

        match self.fallback.connect().await {
            Ok(transport) => {
                tracing::info!(
                    transport = %transport.transport_type(),
                    "connected via fallback transport"
                );
                Ok(HybridTransport::Fallback(transport))
            }
            Err(e) => {
                tracing::warn!(err = %e, "fallback transport failed");
                Err(e)
            }
        }
    }
}

/// A transport established by [`HybridConnector`].
pub enum HybridTransport<A: Transport, B: Transport> {
    /// Connected via the preferred connector.
    Preferred(A),
    /// Connected via the fallback connector.
    Fallback(B),
}

impl<A: Transport, B: Transport> HybridTransport<A, B> {
    /// Whether this connection came from the fallback connector.
    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

impl<A: Transport, B: Transport> Transport for HybridTransport<A, B> {
    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        match self {
            Self::Preferred(t) => t.send(frame).await,
            Self::Fallback(t) => t.send(frame).await,
        }
    }

    async fn recv(&self) -> Result<String, TransportError> {
        match self {
            Self::Preferred(t) => t.recv().await,
            Self::Fallback(t) => t.recv().await,
        }
    }

    async fn close(&self) {
        match self {
            Self::Preferred(t) => t.close().await,
            Self::Fallback(t) => t.close().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Preferred(t) => t.is_connected(),
            Self::Fallback(t) => t.is_connected(),
        }
    }

    fn transport_type(&self) -> TransportType {
        match self {
            Self::Preferred(t) => t.transport_type(),
            Self::Fallback(t) => t.transport_type(),
        }
    }
}
