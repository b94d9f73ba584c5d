//! # polyglot-translate
//!
//! The credential lifecycle and translation dispatch core of Polyglot.
//!
//! Many concurrent translation requests share one expiring bearer token.
//! The [`credential::CredentialStore`] holds the current token behind a
//! generation counter; the [`refresher::Refresher`] is the only writer and
//! renews the token proactively before expiry and on demand when a request
//! observes an auth rejection. The [`dispatch::TranslationService`] runs the
//! per-request control flow: obtain a token, call the translation API, and
//! apply a bounded retry on auth rejection or rate limiting.

pub mod client;
pub mod credential;
pub mod dispatch;
pub mod refresher;

#[cfg(test)]
mod tests;

pub use client::{HttpTranslator, TranslateError, Translator};
pub use credential::{Credential, CredentialStore};
pub use dispatch::{DispatchConfig, Translated, TranslationRequest, TranslationService};
pub use refresher::{
    ForceRefreshError, HttpTokenIssuer, IssueError, IssuedToken, RefreshConfig, Refresher,
    RefresherHandle, TokenIssuer,
};
