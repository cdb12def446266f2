//! Classification of failed server exchanges.
//!
//! The controller only distinguishes two classes: trust failures, which stop
//! the agent outright, and everything else, which is retried with jittered
//! backoff.

use thiserror::Error;

/// Why a register or heartbeat exchange failed.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// TLS certificate verification failed. Retrying cannot help; the server
    /// certificate has to be fixed out of band.
    #[error("server certificate verification failed: {0}")]
    Trust(#[source] reqwest::Error),
    /// Network, HTTP status or body decode failure. Safe to retry.
    #[error("transient exchange failure: {0}")]
    Transient(#[source] anyhow::Error),
}

/// Sort a reqwest failure into terminal-vs-transient.
pub fn classify(err: reqwest::Error) -> ExchangeError {
    if is_trust_failure(&err) {
        ExchangeError::Trust(err)
    } else {
        ExchangeError::Transient(err.into())
    }
}

/// Walk the source chain looking for a certificate verification failure.
/// reqwest does not expose the TLS error kind directly, so this matches the
/// message the way the underlying TLS backends phrase it.
fn is_trust_failure(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if text.contains("certificate") || text.contains("UnknownIssuer") {
            return true;
        }
        source = cause.source();
    }
    false
}
