use log::debug;

use super::method::{decode_children, decode_value, Request};
use super::Session;
use crate::core::{Result, StoreError};

impl Session<'_> {
    /// Read the value at `path`.
    ///
    /// A provider failure or a missing output is [`StoreError::NotFound`].
    pub fn get(&self, path: &str) -> Result<Vec<u8>> {
        match self.call(Request::GetValue { path }) {
            Ok(out) => decode_value(out, path),
            Err(StoreError::Invocation { status, .. }) => {
                debug!("GetValue {} failed with {:#010x}", path, status);
                Err(StoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Write `value` at `path`, creating intermediate nodes as the provider
    /// sees fit.
    pub fn set(&self, path: &str, value: &[u8]) -> Result<()> {
        self.call(Request::SetValue { path, value })?
            .map(|_| ())
            .ok_or_else(|| no_output("SetValue"))
    }

    /// Remove `path` and everything beneath it.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.call(Request::RemoveValue { path })?
            .map(|_| ())
            .ok_or_else(|| no_output("RemoveValue"))
    }

    /// Names of the immediate children of `path`.
    ///
    /// A leaf, or a path the provider cannot enumerate, gives an empty list.
    pub fn children(&self, path: &str) -> Result<Vec<String>> {
        match self.call(Request::GetChildren { path }) {
            Ok(out) => Ok(decode_children(out, path)),
            Err(StoreError::Invocation { status, .. }) => {
                debug!("GetChildren {} failed with {:#010x}", path, status);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

fn no_output(method: &str) -> StoreError {
    StoreError::invocation(method, crate::provider::status::WBEM_E_FAILED)
}
