// ============================================================================
// Loopback store state
// ============================================================================
//
// Sessions, per-session transactions and watches, and the method dispatch
// behind `CitrixXenStoreBase` / `CitrixXenStoreSession`.
//
// Transactions work on a private copy of the tree and record their
// operations; commit replays the operations onto the live tree and only
// then fires watches. Abort (or ending the session) drops the copy.
//
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};

use super::events::EventHub;
use super::tree::{is_under, Tree};
use super::ProviderStats;
use crate::core::instance::PARAMETERS_CLASS;
use crate::core::method::{BASE_CLASS, SESSION_CLASS, WATCH_EVENT_CLASS};
use crate::core::{Instance, Method, Result, StoreError, Variant, PATH_PROPERTY};
use crate::provider::status;

/// Class of the nested object returned by `GetChildren`.
pub const CHILDREN_CLASS: &str = "CitrixXenStoreChildren";

/// Object path of the base singleton.
pub fn base_path() -> String {
    format!("{}=@", BASE_CLASS)
}

pub fn session_path(id: u32) -> String {
    format!("{}.SessionId={}", SESSION_CLASS, id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Base,
    Session(u32),
}

impl Target {
    pub fn parse(object_path: &str) -> Option<Self> {
        if object_path == base_path() {
            return Some(Target::Base);
        }
        object_path
            .strip_prefix(SESSION_CLASS)
            .and_then(|rest| rest.strip_prefix(".SessionId="))
            .and_then(|id| id.parse().ok())
            .map(Target::Session)
    }
}

#[derive(Debug, Clone)]
enum TxnOp {
    Write(String, String),
    Remove(String),
}

#[derive(Debug, Clone)]
struct Txn {
    working: Tree,
    ops: Vec<TxnOp>,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: u32,
    pub name: String,
    transaction: Option<Txn>,
    /// Registrations per watched path; a path stays watched until its
    /// count drops to zero.
    pub watches: BTreeMap<String, usize>,
}

impl SessionState {
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn instance(&self) -> Instance {
        Instance::new(SESSION_CLASS)
            .with(PATH_PROPERTY, session_path(self.id).as_str())
            .with("Id", self.name.as_str())
            .with("SessionId", Variant::UI4(self.id))
    }
}

#[derive(Debug, Default)]
pub struct StoreState {
    pub tree: Tree,
    pub sessions: BTreeMap<u32, SessionState>,
    pub log: Vec<(u32, String)>,
    pub stats: ProviderStats,
    next_session_id: u32,
}

fn out_params() -> Instance {
    Instance::new(PARAMETERS_CLASS)
}

fn text_param(params: Option<&Instance>, method: Method, name: &str) -> Result<String> {
    params
        .and_then(|p| p.get(name))
        .and_then(Variant::as_string)
        .ok_or_else(|| StoreError::invocation(method.name(), status::WBEM_E_INVALID_PARAMETER))
}

impl StoreState {
    pub fn session_instances(&self) -> Vec<Instance> {
        self.sessions.values().map(SessionState::instance).collect()
    }

    pub fn exec(
        &mut self,
        target: Target,
        method: Method,
        params: Option<&Instance>,
        hub: &EventHub,
    ) -> Result<Option<Instance>> {
        match target {
            Target::Base => self.exec_base(method, params),
            Target::Session(id) => self.exec_session(id, method, params, hub),
        }
    }

    fn exec_base(&mut self, method: Method, params: Option<&Instance>) -> Result<Option<Instance>> {
        if method != Method::AddSession {
            return Err(StoreError::invocation(method.name(), status::WBEM_E_INVALID_METHOD));
        }

        let name = text_param(params, method, "Id")?;
        self.next_session_id += 1;
        let id = self.next_session_id;
        self.sessions.insert(
            id,
            SessionState {
                id,
                name,
                transaction: None,
                watches: BTreeMap::new(),
            },
        );
        self.stats.sessions_created += 1;

        Ok(Some(out_params().with("SessionId", Variant::UI4(id))))
    }

    fn exec_session(
        &mut self,
        id: u32,
        method: Method,
        params: Option<&Instance>,
        hub: &EventHub,
    ) -> Result<Option<Instance>> {
        let not_found = || StoreError::invocation(method.name(), status::WBEM_E_NOT_FOUND);
        let failed = || StoreError::invocation(method.name(), status::WBEM_E_FAILED);

        if !self.sessions.contains_key(&id) {
            return Err(not_found());
        }

        match method {
            Method::AddSession => Err(StoreError::invocation(method.name(), status::WBEM_E_INVALID_METHOD)),

            Method::EndSession => {
                if let Some(session) = self.sessions.remove(&id) {
                    if session.in_transaction() {
                        self.stats.transactions_discarded += 1;
                    }
                }
                self.stats.sessions_ended += 1;
                Ok(Some(out_params()))
            }

            Method::GetValue => {
                let path = text_param(params, method, "PathName")?;
                let value = self.view(id).read(&path).ok_or_else(not_found)?;
                Ok(Some(out_params().with("value", value)))
            }

            Method::SetValue => {
                let path = text_param(params, method, "PathName")?;
                let value = text_param(params, method, "value")?;
                if let Some(txn) = self.txn_mut(id) {
                    txn.working.write(&path, &value);
                    txn.ops.push(TxnOp::Write(path, value));
                } else {
                    self.tree.write(&path, &value);
                    self.fire(&[path], hub);
                }
                Ok(Some(out_params()))
            }

            Method::RemoveValue => {
                let path = text_param(params, method, "PathName")?;
                if let Some(txn) = self.txn_mut(id) {
                    if !txn.working.remove(&path) {
                        return Err(not_found());
                    }
                    txn.ops.push(TxnOp::Remove(path));
                } else {
                    if !self.tree.remove(&path) {
                        return Err(not_found());
                    }
                    self.fire(&[path], hub);
                }
                Ok(Some(out_params()))
            }

            Method::GetChildren => {
                let path = text_param(params, method, "PathName")?;
                let names = self.view(id).children(&path).ok_or_else(not_found)?;
                let inner = Instance::new(CHILDREN_CLASS)
                    .with("NoOfChildNodes", Variant::I4(names.len() as i32))
                    .with(
                        "ChildNodes",
                        Variant::Array(names.iter().map(|n| Variant::text(n)).collect()),
                    );
                Ok(Some(out_params().with("children", Variant::object(inner))))
            }

            Method::StartTransaction => {
                let working = self.tree.clone();
                let session = self.sessions.get_mut(&id).ok_or_else(not_found)?;
                if session.transaction.is_some() {
                    return Err(failed());
                }
                session.transaction = Some(Txn {
                    working,
                    ops: Vec::new(),
                });
                self.stats.transactions_started += 1;
                Ok(Some(out_params()))
            }

            Method::CommitTransaction => {
                let txn = self.take_txn(id).ok_or_else(failed)?;
                let mut changed = Vec::with_capacity(txn.ops.len());
                for op in txn.ops {
                    match op {
                        TxnOp::Write(path, value) => {
                            self.tree.write(&path, &value);
                            changed.push(path);
                        }
                        TxnOp::Remove(path) => {
                            if self.tree.remove(&path) {
                                changed.push(path);
                            }
                        }
                    }
                }
                self.stats.transactions_committed += 1;
                self.fire(&changed, hub);
                Ok(Some(out_params()))
            }

            Method::AbortTransaction => {
                self.take_txn(id).ok_or_else(failed)?;
                self.stats.transactions_aborted += 1;
                Ok(Some(out_params()))
            }

            Method::SetWatch => {
                let path = text_param(params, method, "PathName")?;
                if let Some(session) = self.sessions.get_mut(&id) {
                    *session.watches.entry(path).or_insert(0) += 1;
                }
                Ok(Some(out_params()))
            }

            Method::RemoveWatch => {
                let path = text_param(params, method, "PathName")?;
                let session = self.sessions.get_mut(&id).ok_or_else(not_found)?;
                let count = session.watches.get_mut(&path).ok_or_else(not_found)?;
                *count -= 1;
                if *count == 0 {
                    session.watches.remove(&path);
                }
                Ok(Some(out_params()))
            }

            Method::Log => {
                let message = text_param(params, method, "Message")?;
                self.log.push((id, message));
                Ok(Some(out_params()))
            }
        }
    }

    /// Tree as seen by session `id`: its transaction copy if one is open.
    fn view(&self, id: u32) -> &Tree {
        self.sessions
            .get(&id)
            .and_then(|s| s.transaction.as_ref())
            .map(|t| &t.working)
            .unwrap_or(&self.tree)
    }

    fn txn_mut(&mut self, id: u32) -> Option<&mut Txn> {
        self.sessions.get_mut(&id).and_then(|s| s.transaction.as_mut())
    }

    fn take_txn(&mut self, id: u32) -> Option<Txn> {
        self.sessions.get_mut(&id).and_then(|s| s.transaction.take())
    }

    /// Write outside any session, as another domain would.
    pub fn external_write(&mut self, path: &str, value: &str, hub: &EventHub) {
        self.tree.write(path, value);
        self.fire(&[path.to_string()], hub);
    }

    /// Raise one watch event per registered watch covering any changed path.
    fn fire(&mut self, changed: &[String], hub: &EventHub) {
        let watches: BTreeSet<&String> = self
            .sessions
            .values()
            .flat_map(|s| s.watches.keys())
            .filter(|w| changed.iter().any(|c| is_under(w, c)))
            .collect();

        let mut queued = 0u64;
        for watch in watches {
            let event = Instance::new(WATCH_EVENT_CLASS).with("EventId", watch.as_str());
            queued += hub.publish(&event).unwrap_or(0) as u64;
        }
        self.stats.events_published += queued;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Instance {
        pairs
            .iter()
            .fold(Instance::new(PARAMETERS_CLASS), |inst, (k, v)| inst.with(*k, *v))
    }

    fn open(state: &mut StoreState, hub: &EventHub) -> u32 {
        let out = state
            .exec(Target::Base, Method::AddSession, Some(&params(&[("Id", "test")])), hub)
            .unwrap()
            .unwrap();
        match out.get("SessionId") {
            Some(Variant::UI4(id)) => *id,
            other => panic!("unexpected session id {:?}", other),
        }
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(Target::parse("CitrixXenStoreBase=@"), Some(Target::Base));
        assert_eq!(Target::parse(&session_path(12)), Some(Target::Session(12)));
        assert_eq!(Target::parse("CitrixXenStoreSession.SessionId=x"), None);
        assert_eq!(Target::parse("Win32_OperatingSystem=@"), None);
    }

    #[test]
    fn test_transaction_isolation() {
        let hub = EventHub::default();
        let mut state = StoreState::default();
        let id = open(&mut state, &hub);

        state.exec(Target::Session(id), Method::StartTransaction, None, &hub).unwrap();
        state
            .exec(Target::Session(id), Method::SetValue, Some(&params(&[("PathName", "a"), ("value", "1")])), &hub)
            .unwrap();

        assert_eq!(state.tree.read("a"), None);
        assert_eq!(state.view(id).read("a"), Some("1"));

        state.exec(Target::Session(id), Method::CommitTransaction, None, &hub).unwrap();
        assert_eq!(state.tree.read("a"), Some("1"));
        assert_eq!(state.stats.transactions_committed, 1);
    }

    #[test]
    fn test_double_start_fails() {
        let hub = EventHub::default();
        let mut state = StoreState::default();
        let id = open(&mut state, &hub);

        state.exec(Target::Session(id), Method::StartTransaction, None, &hub).unwrap();
        let err = state.exec(Target::Session(id), Method::StartTransaction, None, &hub).unwrap_err();
        assert_eq!(err.status(), Some(status::WBEM_E_FAILED));
    }

    #[test]
    fn test_end_session_discards_transaction() {
        let hub = EventHub::default();
        let mut state = StoreState::default();
        let id = open(&mut state, &hub);

        state.exec(Target::Session(id), Method::StartTransaction, None, &hub).unwrap();
        state.exec(Target::Session(id), Method::EndSession, None, &hub).unwrap();

        assert!(state.sessions.is_empty());
        assert_eq!(state.stats.transactions_discarded, 1);
        let err = state.exec(Target::Session(id), Method::GetValue, None, &hub).unwrap_err();
        assert_eq!(err.status(), Some(status::WBEM_E_NOT_FOUND));
    }

    #[test]
    fn test_watch_registrations_are_counted() {
        let hub = EventHub::default();
        let mut state = StoreState::default();
        let id = open(&mut state, &hub);
        let path = params(&[("PathName", "control")]);

        state.exec(Target::Session(id), Method::SetWatch, Some(&path), &hub).unwrap();
        state.exec(Target::Session(id), Method::SetWatch, Some(&path), &hub).unwrap();
        state.exec(Target::Session(id), Method::RemoveWatch, Some(&path), &hub).unwrap();
        assert_eq!(state.sessions[&id].watches.get("control"), Some(&1));

        state.exec(Target::Session(id), Method::RemoveWatch, Some(&path), &hub).unwrap();
        assert!(state.sessions[&id].watches.is_empty());

        let err = state
            .exec(Target::Session(id), Method::RemoveWatch, Some(&path), &hub)
            .unwrap_err();
        assert_eq!(err.status(), Some(status::WBEM_E_NOT_FOUND));
    }

    #[test]
    fn test_missing_param_is_invalid_parameter() {
        let hub = EventHub::default();
        let mut state = StoreState::default();
        let id = open(&mut state, &hub);

        let err = state.exec(Target::Session(id), Method::SetValue, None, &hub).unwrap_err();
        assert_eq!(err.status(), Some(status::WBEM_E_INVALID_PARAMETER));
    }
}
