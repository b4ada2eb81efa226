//! Client surface for the Dataverse organization service.
//!
//! The migration core never talks HTTP directly; it goes through the
//! [OrganizationService] trait. The REST implementation in [rest] is one
//! provider of that trait; tests script another.

mod auth;
mod error;
mod options;
pub mod rest;
mod row;
mod service;

pub use auth::{AuthenticationProvider, StaticTokenProvider};
pub use error::{InitFailure, ServiceError, ServiceErrorKind};
pub use options::{BypassPlugins, CallOptions};
pub use row::{OperationKind, Row, RowPage};
pub use service::{
    BulkResponse, BulkRowError, OrganizationService, PagingInfo, RowSuccess, UpsertOutcome,
};
