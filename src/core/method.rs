use std::fmt;

/// Singleton class through which sessions are created.
pub const BASE_CLASS: &str = "CitrixXenStoreBase";
/// Class of live session objects.
pub const SESSION_CLASS: &str = "CitrixXenStoreSession";
/// Event raised when a watched path changes.
pub const WATCH_EVENT_CLASS: &str = "CitrixXenStoreWatchEvent";
/// Event raised when the store leaves the suspended state.
pub const UNSUSPENDED_EVENT_CLASS: &str = "CitrixXenStoreUnsuspendedEvent";

/// Every remote method this crate invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    AddSession,
    EndSession,
    GetValue,
    SetValue,
    RemoveValue,
    GetChildren,
    StartTransaction,
    CommitTransaction,
    AbortTransaction,
    SetWatch,
    RemoveWatch,
    Log,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::AddSession => "AddSession",
            Method::EndSession => "EndSession",
            Method::GetValue => "GetValue",
            Method::SetValue => "SetValue",
            Method::RemoveValue => "RemoveValue",
            Method::GetChildren => "GetChildren",
            Method::StartTransaction => "StartTransaction",
            Method::CommitTransaction => "CommitTransaction",
            Method::AbortTransaction => "AbortTransaction",
            Method::SetWatch => "SetWatch",
            Method::RemoveWatch => "RemoveWatch",
            Method::Log => "Log",
        }
    }

    /// Class that declares the method.
    pub fn class(&self) -> &'static str {
        match self {
            Method::AddSession => BASE_CLASS,
            _ => SESSION_CLASS,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }

    pub const ALL: [Method; 12] = [
        Method::AddSession,
        Method::EndSession,
        Method::GetValue,
        Method::SetValue,
        Method::RemoveValue,
        Method::GetChildren,
        Method::StartTransaction,
        Method::CommitTransaction,
        Method::AbortTransaction,
        Method::SetWatch,
        Method::RemoveWatch,
        Method::Log,
    ];
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class(), self.name())
    }
}
