//! Transfer process records and the state table they move through

use chrono::{DateTime, Utc};
use conduit_registry::{SelectionResult, TransportType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Lifecycle state of a transfer process
///
/// ```text
/// REQUESTED ──► PROVISIONING ──► IN_PROGRESS ──► COMPLETED
///                    │                │
///                    └──► FAILED ◄────┘
///
/// any non-terminal ──► TERMINATED
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Requested,
    Provisioning,
    InProgress,
    Completed,
    Failed,
    Terminated,
}

impl TransferState {
    pub const ALL: [TransferState; 6] = [
        TransferState::Requested,
        TransferState::Provisioning,
        TransferState::InProgress,
        TransferState::Completed,
        TransferState::Failed,
        TransferState::Terminated,
    ];

    pub const NON_TERMINAL: [TransferState; 3] = [
        TransferState::Requested,
        TransferState::Provisioning,
        TransferState::InProgress,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Terminated
        )
    }

    /// Whether the state table has an edge from `self` to `target`
    ///
    /// `REQUESTED → FAILED` is the no-data-plane exit taken by `start`.
    pub fn can_transition_to(&self, target: TransferState) -> bool {
        use TransferState::*;
        match (self, target) {
            (Requested, Provisioning) => true,
            (Requested, Failed) => true,
            (Provisioning, InProgress) => true,
            (Provisioning, Failed) => true,
            (InProgress, Completed) => true,
            (InProgress, Failed) => true,
            (from, Terminated) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Requested => "REQUESTED",
            TransferState::Provisioning => "PROVISIONING",
            TransferState::InProgress => "IN_PROGRESS",
            TransferState::Completed => "COMPLETED",
            TransferState::Failed => "FAILED",
            TransferState::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TransferState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "REQUESTED" => Ok(TransferState::Requested),
            "PROVISIONING" => Ok(TransferState::Provisioning),
            "IN_PROGRESS" => Ok(TransferState::InProgress),
            "COMPLETED" => Ok(TransferState::Completed),
            "FAILED" => Ok(TransferState::Failed),
            "TERMINATED" => Ok(TransferState::Terminated),
            _ => Err(format!("Invalid transfer state: {}", s)),
        }
    }
}

/// Machine-readable reason attached to a terminal state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalReason {
    /// No healthy data plane advertised the requested transport type
    NoDataPlaneAvailable,
    /// Every provisioning attempt was rejected
    ProvisioningExhausted,
    /// The data plane went silent past the transfer deadline
    DataPlaneTimeout,
    /// The data plane reported a failure with its own error code
    DataPlaneError(String),
    /// Explicit cancellation
    Cancelled,
}

impl TerminalReason {
    /// Codes the engine assigns itself
    pub const ENGINE_CODES: [&'static str; 4] = [
        "NO_DATA_PLANE_AVAILABLE",
        "PROVISIONING_EXHAUSTED",
        "DATA_PLANE_TIMEOUT",
        "CANCELLED",
    ];

    /// Prefix for data-plane codes that collide with [`Self::ENGINE_CODES`]
    pub const DATA_PLANE_PREFIX: &'static str = "DATA_PLANE:";

    /// Reason for a failure reported by a data plane
    ///
    /// A code equal to one of the engine's own is namespaced under
    /// `DATA_PLANE:` so the two never read the same.
    pub fn data_plane(code: impl Into<String>) -> Self {
        let code = code.into();
        if Self::ENGINE_CODES.contains(&code.as_str()) {
            TerminalReason::DataPlaneError(format!("{}{}", Self::DATA_PLANE_PREFIX, code))
        } else {
            TerminalReason::DataPlaneError(code)
        }
    }

    /// Reason code as surfaced to callers
    pub fn code(&self) -> &str {
        match self {
            TerminalReason::NoDataPlaneAvailable => "NO_DATA_PLANE_AVAILABLE",
            TerminalReason::ProvisioningExhausted => "PROVISIONING_EXHAUSTED",
            TerminalReason::DataPlaneTimeout => "DATA_PLANE_TIMEOUT",
            TerminalReason::DataPlaneError(code) => code,
            TerminalReason::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Where data is read from or written to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Transport-specific address (URL, path, container, ...)
    pub address: String,

    /// Transport type of this endpoint
    pub transport_type: TransportType,

    /// Opaque reference to credentials supplied by the identity layer
    pub credentials_ref: Option<String>,

    /// Additional transport-specific properties
    pub properties: BTreeMap<String, String>,
}

impl EndpointDescriptor {
    pub fn new(address: impl Into<String>, transport_type: impl Into<TransportType>) -> Self {
        Self {
            address: address.into(),
            transport_type: transport_type.into(),
            credentials_ref: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_credentials(mut self, credentials_ref: impl Into<String>) -> Self {
        self.credentials_ref = Some(credentials_ref.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Handle issued by a data plane when it accepts a transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TransferHandle(pub String);

impl TransferHandle {
    pub fn new(value: impl Into<String>) -> Self {
        TransferHandle(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One committed state, with the time it was entered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateEntry {
    pub state: TransferState,
    pub entered_at: DateTime<Utc>,
}

/// Attempted edge not in the state table, or already taken
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal transition for {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: TransferState,
    pub to: TransferState,
}

/// Stateful record of one data-movement attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferProcess {
    /// Unique, immutable process id
    pub id: String,

    /// Reference to the agreement authorizing this transfer
    pub contract_id: String,

    pub source: EndpointDescriptor,

    pub destination: EndpointDescriptor,

    /// Transport type the data plane must support
    pub transport_type: TransportType,

    /// Current state; always equal to the last history entry
    pub state: TransferState,

    /// Every committed state in commit order
    pub history: Vec<StateEntry>,

    /// Data plane currently responsible, if any
    pub selection: Option<SelectionResult>,

    /// Handle issued by the selected data plane
    pub transfer_handle: Option<TransferHandle>,

    /// Instances that rejected this process during provisioning
    pub failed_instances: Vec<String>,

    /// Number of failed provisioning attempts
    pub retry_count: u32,

    pub last_error: Option<String>,

    /// Set when the process reaches a terminal state
    pub reason: Option<TerminalReason>,

    /// Human-readable detail accompanying `reason`
    pub reason_detail: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl TransferProcess {
    /// Create a process in `REQUESTED`
    pub fn new(
        id: impl Into<String>,
        contract_id: impl Into<String>,
        source: EndpointDescriptor,
        destination: EndpointDescriptor,
        transport_type: impl Into<TransportType>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            contract_id: contract_id.into(),
            source,
            destination,
            transport_type: transport_type.into(),
            state: TransferState::Requested,
            history: vec![StateEntry {
                state: TransferState::Requested,
                entered_at: now,
            }],
            selection: None,
            transfer_handle: None,
            failed_instances: Vec::new(),
            retry_count: 0,
            last_error: None,
            reason: None,
            reason_detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether `state` has ever been committed for this process
    pub fn has_entered(&self, state: TransferState) -> bool {
        self.history.iter().any(|entry| entry.state == state)
    }

    /// When the current state was entered
    pub fn state_entered_at(&self) -> DateTime<Utc> {
        self.history
            .last()
            .map(|entry| entry.entered_at)
            .unwrap_or(self.created_at)
    }

    /// Check that `target` may be applied without mutating the record
    pub fn check_transition(&self, target: TransferState) -> Result<(), TransitionError> {
        if self.state.can_transition_to(target) && !self.has_entered(target) {
            Ok(())
        } else {
            Err(TransitionError {
                id: self.id.clone(),
                from: self.state,
                to: target,
            })
        }
    }

    /// Apply a transition to the in-memory record
    ///
    /// Rejects edges missing from the state table and any target state the
    /// process has already entered. Nothing is persisted here.
    pub fn apply(&mut self, target: TransferState, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.check_transition(target)?;
        self.state = target;
        self.history.push(StateEntry {
            state: target,
            entered_at: at,
        });
        self.updated_at = at;
        Ok(())
    }

    /// Apply a terminal transition together with its reason
    pub fn finish(
        &mut self,
        target: TransferState,
        reason: TerminalReason,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        debug_assert!(target.is_terminal());
        self.apply(target, at)?;
        self.reason = Some(reason);
        self.reason_detail = detail;
        Ok(())
    }

    /// Instance ids the selector must skip for this process
    pub fn excluded_instances(&self) -> &[String] {
        &self.failed_instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn process() -> TransferProcess {
        TransferProcess::new(
            "tp-1",
            "contract-1",
            EndpointDescriptor::new("/src/a", "FILE"),
            EndpointDescriptor::new("/dst/a", "FILE"),
            "HTTP-PULL",
        )
    }

    #[test]
    fn test_state_display_and_parse() {
        for state in TransferState::ALL {
            assert_eq!(TransferState::from_str(&state.to_string()).unwrap(), state);
        }
        assert_eq!(
            TransferState::from_str("in-progress").unwrap(),
            TransferState::InProgress
        );
        assert!(TransferState::from_str("paused").is_err());
    }

    #[test]
    fn test_state_table() {
        use TransferState::*;
        assert!(Requested.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Failed));
        for state in TransferState::NON_TERMINAL {
            assert!(state.can_transition_to(Terminated));
        }

        assert!(!Requested.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Terminated));
    }

    #[test]
    fn test_apply_records_history() {
        let mut p = process();
        let t = Utc::now();
        p.apply(TransferState::Provisioning, t).unwrap();
        p.apply(TransferState::InProgress, t).unwrap();

        let states: Vec<_> = p.history.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                TransferState::Requested,
                TransferState::Provisioning,
                TransferState::InProgress
            ]
        );
        assert_eq!(p.state, TransferState::InProgress);
    }

    #[test]
    fn test_completed_cannot_go_back() {
        let mut p = process();
        let t = Utc::now();
        p.apply(TransferState::Provisioning, t).unwrap();
        p.apply(TransferState::InProgress, t).unwrap();
        p.apply(TransferState::Completed, t).unwrap();

        let err = p.apply(TransferState::InProgress, t).unwrap_err();
        assert_eq!(err.from, TransferState::Completed);
        assert_eq!(err.to, TransferState::InProgress);
        assert_eq!(p.state, TransferState::Completed);
    }

    #[test]
    fn test_finish_sets_reason() {
        let mut p = process();
        p.finish(
            TransferState::Failed,
            TerminalReason::NoDataPlaneAvailable,
            Some("nothing for HTTP-PULL".to_string()),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(p.reason.as_ref().map(|r| r.code()), Some("NO_DATA_PLANE_AVAILABLE"));
        assert!(p.is_terminal());
    }

    #[test]
    fn test_reported_error_code_is_reason_code() {
        let reason = TerminalReason::DataPlaneError("SINK_WRITE_FAILED".to_string());
        assert_eq!(reason.code(), "SINK_WRITE_FAILED");
    }

    #[test]
    fn test_endpoint_properties() {
        let endpoint = EndpointDescriptor::new("container", "AZURE-BLOB")
            .with_property("blobname", "malo_123")
            .with_credentials("vault://sas/1");

        assert_eq!(endpoint.property("blobname"), Some("malo_123"));
        assert_eq!(endpoint.credentials_ref.as_deref(), Some("vault://sas/1"));
        assert_eq!(endpoint.transport_type.as_str(), "AZURE-BLOB");
    }

    #[test]
    fn test_data_plane_codes_never_shadow_engine_codes() {
        assert_eq!(TerminalReason::data_plane("IO_ERROR").code(), "IO_ERROR");
        assert_eq!(
            TerminalReason::data_plane("CANCELLED").code(),
            "DATA_PLANE:CANCELLED"
        );
        for code in TerminalReason::ENGINE_CODES {
            assert_ne!(TerminalReason::data_plane(code).code(), code);
        }
    }
}
