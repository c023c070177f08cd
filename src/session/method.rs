// ============================================================================
// Method marshaling
// ============================================================================
//
// The only place that knows parameter names. Callers build a typed
// `Request`, `invoke` turns it into an in-parameter instance and runs it,
// and the `decode_*` helpers pull typed values back out of the provider's
// out-parameter instance.
//
// ============================================================================

use log::warn;

use crate::connection::ProviderConnection;
use crate::core::codec::{from_wide, to_wide, variant_to_u64};
use crate::core::{Instance, Method, Result, StoreError, Variant};

/// One call to a base or session method, with its typed arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request<'a> {
    AddSession { id: &'a str },
    EndSession,
    GetValue { path: &'a str },
    SetValue { path: &'a str, value: &'a [u8] },
    RemoveValue { path: &'a str },
    GetChildren { path: &'a str },
    StartTransaction,
    CommitTransaction,
    AbortTransaction,
    SetWatch { path: &'a str },
    RemoveWatch { path: &'a str },
    Log { message: &'a str },
}

impl Request<'_> {
    pub fn method(&self) -> Method {
        match self {
            Request::AddSession { .. } => Method::AddSession,
            Request::EndSession => Method::EndSession,
            Request::GetValue { .. } => Method::GetValue,
            Request::SetValue { .. } => Method::SetValue,
            Request::RemoveValue { .. } => Method::RemoveValue,
            Request::GetChildren { .. } => Method::GetChildren,
            Request::StartTransaction => Method::StartTransaction,
            Request::CommitTransaction => Method::CommitTransaction,
            Request::AbortTransaction => Method::AbortTransaction,
            Request::SetWatch { .. } => Method::SetWatch,
            Request::RemoveWatch { .. } => Method::RemoveWatch,
            Request::Log { .. } => Method::Log,
        }
    }

    /// Named arguments, already in wire form. Empty for zero-parameter
    /// methods.
    fn arguments(&self) -> Result<Vec<(&'static str, Variant)>> {
        let args = match *self {
            Request::AddSession { id } => vec![("Id", Variant::text(id))],
            Request::SetValue { path, value } => vec![
                ("PathName", Variant::text(path)),
                ("value", Variant::Bstr(to_wide(value)?)),
            ],
            Request::GetValue { path }
            | Request::RemoveValue { path }
            | Request::GetChildren { path }
            | Request::SetWatch { path }
            | Request::RemoveWatch { path } => vec![("PathName", Variant::text(path))],
            Request::Log { message } => vec![("Message", Variant::text(message))],
            Request::EndSession
            | Request::StartTransaction
            | Request::CommitTransaction
            | Request::AbortTransaction => Vec::new(),
        };
        Ok(args)
    }
}

/// Marshal `request` and execute it against `target`.
pub(crate) fn invoke(
    conn: &ProviderConnection,
    target: &Instance,
    request: Request<'_>,
) -> Result<Option<Instance>> {
    let method = request.method();
    let arguments = request.arguments()?;

    if arguments.is_empty() {
        return conn.invoke_method(target, method, None);
    }

    let mut params = conn.spawn_params(method)?;
    for (name, value) in arguments {
        params.put(name, value);
    }
    conn.invoke_method(target, method, Some(&params))
}

/// `GetValue` output: the `value` field as caller bytes.
pub(crate) fn decode_value(out: Option<Instance>, path: &str) -> Result<Vec<u8>> {
    let out = out.ok_or_else(|| StoreError::NotFound(path.to_string()))?;
    match out.get("value") {
        Some(Variant::Bstr(text)) => Ok(from_wide(text)),
        Some(other) => {
            warn!("GetValue {} returned {}, treating as missing", path, other.type_name());
            Err(StoreError::NotFound(path.to_string()))
        }
        None => Err(StoreError::NotFound(path.to_string())),
    }
}

/// `AddSession` output: the numeric `SessionId`.
pub(crate) fn decode_session_id(out: Option<Instance>) -> Result<u32> {
    let id = out
        .as_ref()
        .and_then(|o| o.get("SessionId"))
        .map(variant_to_u64)
        .ok_or_else(|| StoreError::NotFound("AddSession returned no SessionId".to_string()))?;

    u32::try_from(id).map_err(|_| StoreError::Marshal(format!("SessionId {} out of range", id)))
}

/// `GetChildren` output: `children.NoOfChildNodes` names from
/// `children.ChildNodes`.
///
/// The count is authoritative. A missing inner object or a zero count is an
/// empty list; an array shorter than the count yields what is there.
pub(crate) fn decode_children(out: Option<Instance>, path: &str) -> Vec<String> {
    let Some(inner) = out
        .as_ref()
        .and_then(|o| o.get("children"))
        .and_then(Variant::as_object)
    else {
        return Vec::new();
    };

    let count = inner
        .get("NoOfChildNodes")
        .and_then(Variant::as_i64)
        .unwrap_or(0);
    if count <= 0 {
        return Vec::new();
    }

    let slots = inner
        .get("ChildNodes")
        .and_then(Variant::as_array)
        .unwrap_or(&[]);
    let count = count as usize;
    if slots.len() < count {
        warn!(
            "GetChildren {}: {} child nodes announced, {} present",
            path,
            count,
            slots.len()
        );
    }

    slots
        .iter()
        .take(count)
        .filter_map(|slot| match slot {
            Variant::Bstr(name) => Some(name.to_string_lossy()),
            other => {
                warn!("GetChildren {}: skipping {} slot", path, other.type_name());
                None
            }
        })
        .collect()
}
