//! `dispatch-core`: domain foundation for the background dispatch core.
//!
//! Identifiers, tenant scoping and the domain error model. No storage or
//! runtime concerns live here.

pub mod error;
pub mod id;
pub mod scope;

pub use error::{DomainError, DomainResult};
pub use id::{
    ConnectorId, DocumentId, ExportJobId, FileId, FrameworkId, OrganizationId, ScimBridgeId,
    ScimConfigurationId, SlackMessageId,
};
pub use scope::Scope;
