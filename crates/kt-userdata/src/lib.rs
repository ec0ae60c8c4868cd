//! # kt-userdata
//!
//! Renders the cloud-init payload handed to every instance of an ephemeral
//! kubeadm cluster.
//!
//! A payload is built from a base template plus a fixed set of sub-documents
//! (kubeadm configs, helper scripts, systemd units). Every document gets the
//! same ordered placeholder substitutions; sub-documents are then gzip
//! compressed, base64 encoded and spliced into the base template.
//!
//! ```text
//! ┌──────────────┐  substitute  ┌─────────────┐  gz+b64   ┌──────────────┐
//! │ sub-document │─────────────►│  rendered   │──────────►│ base template│
//! └──────────────┘              └─────────────┘           └──────┬───────┘
//!                                                                │ role flag
//!                                                                ▼
//!                                                        RenderedUserData
//! ```
//!
//! The control-plane private IP is not known until the control-plane instance
//! exists, so `{{KUBEADM_CONTROL_PLANE_IP}}` survives composition and is
//! filled in by [`RenderedUserData::finalize`] at launch time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod composer;
pub mod encode;
pub mod error;
pub mod placeholder;
pub mod template;

pub use composer::{ClusterValues, Composer, NodeRole, RenderedUserData, MAX_USER_DATA_BYTES};
pub use encode::{gunzip_base64, gzip_base64};
pub use error::{UserDataError, UserDataResult};
pub use placeholder::{find_placeholders, Placeholder};
pub use template::{Document, TemplateSet, TemplateSource};
