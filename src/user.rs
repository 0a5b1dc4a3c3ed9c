/// One person with access to the system.
///
/// The crate never stores user objects; sessions persist only the value of
/// [`id`](User::id) and resolve it back through
/// [`PersistenceLayer::load_user`](crate::PersistenceLayer::load_user) when a
/// session is loaded.
pub trait User: Send + Sync {
    /// The user's unique identifier, typically the primary key of the user
    /// store. [`cuid`](crate::cuid) generates suitable values.
    fn id(&self) -> String;

    /// The roles assigned to this user, for use with
    /// [`RoleHierarchy`](crate::RoleHierarchy).
    fn roles(&self) -> Vec<String>;
}
