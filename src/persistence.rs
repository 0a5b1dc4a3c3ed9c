use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::record::SessionRecord;
use crate::user::User;

/// The methods which read/write session information from/to the permanent
/// data store.
///
/// Every method has a default implementation equal to doing nothing, so
/// backends only implement the subset they support. With the defaults (see
/// [`NullPersistence`]), sessions exist purely in the local cache.
///
/// Errors are reported as [`anyhow::Error`]; the crate surfaces them to its
/// callers as [`Error::Backend`](crate::Error::Backend). A missing session
/// or user is not an error.
///
/// Records are exchanged as [`SessionRecord`] values. Key/value stores
/// typically persist them with the binary codec:
///
/// ```rust,ignore
/// async fn save_session(&self, id: &str, record: &SessionRecord) -> anyhow::Result<()> {
///     self.database.put(id, record.encode()).await
/// }
///
/// async fn load_session(&self, id: &str) -> anyhow::Result<Option<SessionRecord>> {
///     match self.database.get(id).await? {
///         Some(payload) => Ok(Some(SessionRecord::decode(&payload)?)),
///         None => Ok(None),
///     }
/// }
/// ```
///
/// Stores with a textual schema can use [`SessionRecord::to_json`] and
/// [`SessionRecord::from_json`] instead.
#[async_trait]
pub trait PersistenceLayer: Send + Sync {
    /// Retrieves a session record from the permanent data store. If no
    /// session is found for the given identifier, that is not an error:
    /// return `Ok(None)`.
    async fn load_session(&self, _id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(None)
    }

    /// Saves a session record to the permanent data store, inserting or
    /// updating it. Must be atomic with respect to a concurrent
    /// [`load_session`](Self::load_session) of the same identifier.
    ///
    /// Session identifiers are always Base64 strings with a length of 24.
    ///
    /// Note that the crate only deletes expired sessions that are accessed.
    /// Sessions that expire because the user never comes back should be
    /// swept by a periodic job; [`SessionRecord::expired`] implements the
    /// check.
    async fn save_session(&self, _id: &str, _record: &SessionRecord) -> anyhow::Result<()> {
        Ok(())
    }

    /// Deletes a session from the permanent data store. Deleting an absent
    /// identifier is success, not an error.
    async fn delete_session(&self, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Returns the identifiers of all sessions which have the given user
    /// attached to them. This powers the user-scoped operations
    /// ([`SessionManager::log_out`](crate::SessionManager::log_out) and
    /// [`SessionManager::refresh_user`](crate::SessionManager::refresh_user)).
    /// Returning `Ok(None)` marks the query as unsupported, in which case
    /// users may stay logged on with multiple sessions at the same time.
    async fn user_sessions(&self, _user_id: &str) -> anyhow::Result<Option<Vec<String>>> {
        Ok(None)
    }

    /// Loads the user with the given unique identifier (typically the
    /// primary key) from the data store. Called when a loaded session
    /// carries a logged-in user.
    async fn load_user(&self, _user_id: &str) -> anyhow::Result<Option<Arc<dyn User>>> {
        Ok(None)
    }

    /// Returns the role hierarchy as a child-to-parent mapping, consumed by
    /// [`RoleHierarchy`](crate::RoleHierarchy). Roles without an entry have
    /// no parent.
    async fn role_hierarchy(&self) -> anyhow::Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// A backend that persists nothing: loads find nothing, writes are
/// discarded. With it, sessions live only in the local cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPersistence;

impl PersistenceLayer for NullPersistence {}
