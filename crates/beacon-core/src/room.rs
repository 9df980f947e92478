//! Room manager.
//!
//! Rooms are named broadcast groups scoped to an organization, a dashboard or
//! a custom topic. A room is created on first join and removed by the sweeper
//! once it has been empty for longer than its TTL.
//!
//! Room identifiers encode their scope and organization:
//!
//! ```text
//! org:{org}
//! dashboard:{org}:{dashboard}
//! custom:{org}:{key}
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::component::Component;
use crate::error::EngineError;
use crate::identity::{Principal, Role};
use crate::pool::SessionId;

/// Maximum room identifier length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Scope of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomScope {
    Organization,
    Dashboard,
    Custom,
}

impl RoomScope {
    fn prefix(self) -> &'static str {
        match self {
            RoomScope::Organization => "org",
            RoomScope::Dashboard => "dashboard",
            RoomScope::Custom => "custom",
        }
    }
}

impl fmt::Display for RoomScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Build a room id.
///
/// The key is ignored for organization rooms.
#[must_use]
pub fn room_id(scope: RoomScope, organization_id: &str, key: &str) -> RoomId {
    match scope {
        RoomScope::Organization => format!("org:{organization_id}"),
        _ => format!("{}:{organization_id}:{key}", scope.prefix()),
    }
}

/// The default room every session of an organization joins.
#[must_use]
pub fn organization_room(organization_id: &str) -> RoomId {
    room_id(RoomScope::Organization, organization_id, "")
}

/// The room carrying updates for one metric.
#[must_use]
pub fn metric_room(organization_id: &str, metric: &str) -> RoomId {
    room_id(RoomScope::Custom, organization_id, &format!("metric.{metric}"))
}

/// A parsed room identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDescriptor {
    pub id: RoomId,
    pub scope: RoomScope,
    pub organization_id: String,
    pub key: String,
}

/// Validate a room id and split it into its parts.
///
/// # Errors
///
/// Returns `InvalidRoom` if the id is malformed.
pub fn parse_room_id(id: &str) -> Result<RoomDescriptor, EngineError> {
    let invalid = |reason: &str| EngineError::InvalidRoom(format!("{id}: {reason}"));

    if id.is_empty() {
        return Err(invalid("room id cannot be empty"));
    }
    if id.len() > MAX_ROOM_ID_LENGTH {
        return Err(invalid("room id too long"));
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(invalid("room id contains invalid characters"));
    }

    let mut parts = id.splitn(3, ':');
    let prefix = parts.next().unwrap_or_default();
    let organization_id = parts.next().unwrap_or_default();
    let key = parts.next();

    if organization_id.is_empty() {
        return Err(invalid("missing organization"));
    }

    let (scope, key) = match (prefix, key) {
        ("org", None) => (RoomScope::Organization, ""),
        ("dashboard", Some(k)) if !k.is_empty() => (RoomScope::Dashboard, k),
        ("custom", Some(k)) if !k.is_empty() => (RoomScope::Custom, k),
        _ => return Err(invalid("unknown scope or missing key")),
    };

    Ok(RoomDescriptor {
        id: id.to_string(),
        scope,
        organization_id: organization_id.to_string(),
        key: key.to_string(),
    })
}

/// Upstream room-membership decision.
pub trait RoomPolicy: Send + Sync {
    /// Whether the principal may join the room with the requested permissions.
    fn authorize(&self, principal: &Principal, room: &RoomDescriptor, permissions: &[String])
        -> bool;
}

/// Default policy: organization-scoped rooms only.
///
/// Custom rooms whose key starts with `admin.` require an admin role, and
/// asking for `write` permission requires at least a member role.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrganizationPolicy;

impl RoomPolicy for OrganizationPolicy {
    fn authorize(
        &self,
        principal: &Principal,
        room: &RoomDescriptor,
        permissions: &[String],
    ) -> bool {
        if principal.organization_id != room.organization_id {
            return false;
        }
        if room.scope == RoomScope::Custom && room.key.starts_with("admin.") {
            return principal.role >= Role::Admin;
        }
        if permissions.iter().any(|p| p == "write") {
            return principal.role >= Role::Member;
        }
        true
    }
}

/// Room manager configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How long an empty room is kept before it is swept.
    pub ttl: Duration,
    /// Interval of the sweeper task.
    pub sweep_interval: Duration,
    /// Member cap applied to new rooms, if any.
    pub default_capacity: Option<usize>,
    /// Maximum number of rooms.
    pub max_rooms: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            default_capacity: None,
            max_rooms: 10_000,
        }
    }
}

/// A broadcast group.
#[derive(Debug)]
pub struct Room {
    pub descriptor: RoomDescriptor,
    pub members: HashSet<SessionId>,
    pub capacity: Option<usize>,
    pub last_touched: Instant,
}

impl Room {
    fn new(descriptor: RoomDescriptor, capacity: Option<usize>) -> Self {
        Self {
            descriptor,
            members: HashSet::new(),
            capacity,
            last_touched: Instant::now(),
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.members.is_empty() && now.duration_since(self.last_touched) >= ttl
    }
}

/// Room statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_count: usize,
    pub empty_rooms: usize,
    pub total_memberships: usize,
}

/// The room manager.
pub struct RoomManager {
    rooms: DashMap<RoomId, Room>,
    /// Reverse index: session -> joined rooms.
    memberships: DashMap<SessionId, HashSet<RoomId>>,
    policy: Arc<dyn RoomPolicy>,
    config: RoomConfig,
    cancel: CancellationToken,
}

impl RoomManager {
    /// Create a room manager.
    #[must_use]
    pub fn new(config: RoomConfig, policy: Arc<dyn RoomPolicy>) -> Self {
        info!("Creating room manager with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            policy,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Get or create a room.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRoom` for a malformed id and `CapacityExceeded`-like
    /// `RoomFull` when the room table is full.
    pub fn get_or_create_room(
        &self,
        scope: RoomScope,
        organization_id: &str,
        key: &str,
    ) -> Result<RoomId, EngineError> {
        let descriptor = parse_room_id(&room_id(scope, organization_id, key))?;
        let id = descriptor.id.clone();
        self.ensure_room(descriptor)?;
        Ok(id)
    }

    fn ensure_room(&self, descriptor: RoomDescriptor) -> Result<(), EngineError> {
        if self.rooms.contains_key(&descriptor.id) {
            return Ok(());
        }
        if self.rooms.len() >= self.config.max_rooms {
            return Err(EngineError::RoomFull(format!(
                "room limit of {} reached",
                self.config.max_rooms
            )));
        }
        let id = descriptor.id.clone();
        self.rooms.entry(id).or_insert_with(|| {
            debug!(room = %descriptor.id, "Creating room");
            Room::new(descriptor, self.config.default_capacity)
        });
        Ok(())
    }

    /// Join a session to a room, creating the room if needed.
    ///
    /// Joining a room the session is already in succeeds without change.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRoom`, `Unauthorized` or `RoomFull`.
    pub fn join_room(
        &self,
        session_id: &str,
        principal: &Principal,
        room: &str,
        permissions: &[String],
    ) -> Result<(), EngineError> {
        let descriptor = parse_room_id(room)?;

        if !self.policy.authorize(principal, &descriptor, permissions) {
            return Err(EngineError::Unauthorized(format!(
                "{} may not join {}",
                principal.user_id, descriptor.id
            )));
        }

        if !self.rooms.contains_key(room) && self.rooms.len() >= self.config.max_rooms {
            return Err(EngineError::RoomFull(format!(
                "room limit of {} reached",
                self.config.max_rooms
            )));
        }

        {
            let mut entry = self.rooms.entry(room.to_string()).or_insert_with(|| {
                debug!(room = %room, "Creating room");
                Room::new(descriptor, self.config.default_capacity)
            });

            if !entry.members.contains(session_id) {
                if let Some(capacity) = entry.capacity {
                    if entry.members.len() >= capacity {
                        return Err(EngineError::RoomFull(room.to_string()));
                    }
                }
                entry.members.insert(session_id.to_string());
            }
            entry.last_touched = Instant::now();

            debug!(
                room = %room,
                session = %session_id,
                members = entry.members.len(),
                "Joined room"
            );
        }

        self.memberships
            .entry(session_id.to_string())
            .or_default()
            .insert(room.to_string());

        Ok(())
    }

    /// Remove a session from a room.
    ///
    /// Returns `false` if the session was not a member.
    pub fn leave_room(&self, session_id: &str, room: &str) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut entry) => {
                let removed = entry.members.remove(session_id);
                if removed {
                    entry.last_touched = Instant::now();
                    debug!(room = %room, session = %session_id, "Left room");
                }
                removed
            }
            None => false,
        };

        if let Some(mut rooms) = self.memberships.get_mut(session_id) {
            rooms.remove(room);
        }
        self.memberships
            .remove_if(session_id, |_, rooms| rooms.is_empty());

        removed
    }

    /// Remove a session from every room it joined.
    pub fn leave_all(&self, session_id: &str) -> Vec<RoomId> {
        let Some((_, rooms)) = self.memberships.remove(session_id) else {
            return Vec::new();
        };

        let now = Instant::now();
        for room in &rooms {
            if let Some(mut entry) = self.rooms.get_mut(room) {
                entry.members.remove(session_id);
                entry.last_touched = now;
            }
        }

        debug!(session = %session_id, rooms = rooms.len(), "Left all rooms");
        rooms.into_iter().collect()
    }

    /// Tear down a room, removing all of its members.
    pub fn teardown_room(&self, room: &str) -> Vec<SessionId> {
        let Some((_, entry)) = self.rooms.remove(room) else {
            return Vec::new();
        };
        for session in &entry.members {
            if let Some(mut rooms) = self.memberships.get_mut(session) {
                rooms.remove(room);
            }
        }
        info!(room = %room, members = entry.members.len(), "Room torn down");
        entry.members.into_iter().collect()
    }

    /// Whether a session is a member of a room.
    #[must_use]
    pub fn is_member(&self, session_id: &str, room: &str) -> bool {
        self.memberships
            .get(session_id)
            .is_some_and(|rooms| rooms.contains(room))
    }

    /// Members of a room.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<SessionId> {
        self.rooms
            .get(room)
            .map(|r| r.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a session has joined.
    #[must_use]
    pub fn rooms_for(&self, session_id: &str) -> Vec<RoomId> {
        self.memberships
            .get(session_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a room exists.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Remove rooms that have been empty for longer than the TTL.
    pub fn sweep(&self) -> Vec<RoomId> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut evicted = Vec::new();

        self.rooms.retain(|id, room| {
            if room.is_expired(now, ttl) {
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Swept expired rooms");
        }
        evicted
    }

    /// Spawn the periodic sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        manager.sweep();
                    }
                }
            }
        })
    }

    /// Room statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let mut empty_rooms = 0;
        let mut total_memberships = 0;
        for room in self.rooms.iter() {
            if room.members.is_empty() {
                empty_rooms += 1;
            }
            total_memberships += room.members.len();
        }
        RoomStats {
            room_count: self.rooms.len(),
            empty_rooms,
            total_memberships,
        }
    }
}

#[async_trait]
impl Component for RoomManager {
    fn name(&self) -> &'static str {
        "room_manager"
    }

    fn metrics(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or_default()
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.cancel.cancel();
        let rooms = self.rooms.len();
        self.rooms.clear();
        self.memberships.clear();
        info!(rooms, "Room manager shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RoomManager {
        RoomManager::new(RoomConfig::default(), Arc::new(OrganizationPolicy))
    }

    fn member(user: &str, org: &str) -> Principal {
        Principal::new(user, org, Role::Member, user)
    }

    #[test]
    fn test_room_ids() {
        assert_eq!(organization_room("acme"), "org:acme");
        assert_eq!(
            room_id(RoomScope::Dashboard, "acme", "sales"),
            "dashboard:acme:sales"
        );
        assert_eq!(metric_room("acme", "cpu"), "custom:acme:metric.cpu");

        let parsed = parse_room_id("dashboard:acme:sales:q3").unwrap();
        assert_eq!(parsed.scope, RoomScope::Dashboard);
        assert_eq!(parsed.organization_id, "acme");
        assert_eq!(parsed.key, "sales:q3");
    }

    #[test]
    fn test_invalid_room_ids() {
        assert!(parse_room_id("").is_err());
        assert!(parse_room_id("lobby").is_err());
        assert!(parse_room_id("org:").is_err());
        assert!(parse_room_id("dashboard:acme").is_err());
        assert!(parse_room_id("org:acme:extra").is_err());
        assert!(parse_room_id(&format!("custom:acme:{}", "a".repeat(MAX_ROOM_ID_LENGTH))).is_err());
    }

    #[test]
    fn test_join_leave() {
        let rooms = manager();
        let alice = member("alice", "acme");

        rooms.join_room("s-1", &alice, "org:acme", &[]).unwrap();
        assert!(rooms.is_member("s-1", "org:acme"));
        assert_eq!(rooms.members("org:acme"), vec!["s-1".to_string()]);

        // Joining twice is idempotent
        rooms.join_room("s-1", &alice, "org:acme", &[]).unwrap();
        assert_eq!(rooms.members("org:acme").len(), 1);

        assert!(rooms.leave_room("s-1", "org:acme"));
        assert!(!rooms.is_member("s-1", "org:acme"));

        // Leaving an unjoined room is a no-op
        assert!(!rooms.leave_room("s-1", "org:acme"));
        assert!(!rooms.leave_room("s-1", "dashboard:acme:none"));
    }

    #[test]
    fn test_cross_organization_join_is_unauthorized() {
        let rooms = manager();
        let mallory = member("mallory", "globex");

        assert!(matches!(
            rooms.join_room("s-1", &mallory, "dashboard:acme:sales", &[]),
            Err(EngineError::Unauthorized(_))
        ));
        assert!(!rooms.room_exists("dashboard:acme:sales"));
    }

    #[test]
    fn test_admin_rooms_and_write_permission() {
        let rooms = manager();
        let viewer = Principal::new("v", "acme", Role::Viewer, "V");
        let admin = Principal::new("a", "acme", Role::Admin, "A");

        assert!(rooms
            .join_room("s-1", &viewer, "custom:acme:admin.audit", &[])
            .is_err());
        assert!(rooms
            .join_room("s-2", &admin, "custom:acme:admin.audit", &[])
            .is_ok());
        assert!(rooms
            .join_room("s-1", &viewer, "dashboard:acme:ops", &["write".to_string()])
            .is_err());
    }

    #[test]
    fn test_room_full() {
        let rooms = RoomManager::new(
            RoomConfig {
                default_capacity: Some(1),
                ..Default::default()
            },
            Arc::new(OrganizationPolicy),
        );

        rooms
            .join_room("s-1", &member("a", "acme"), "dashboard:acme:ops", &[])
            .unwrap();
        assert_eq!(
            rooms.join_room("s-2", &member("b", "acme"), "dashboard:acme:ops", &[]),
            Err(EngineError::RoomFull("dashboard:acme:ops".into()))
        );
    }

    #[test]
    fn test_leave_all() {
        let rooms = manager();
        let alice = member("alice", "acme");

        rooms.join_room("s-1", &alice, "org:acme", &[]).unwrap();
        rooms
            .join_room("s-1", &alice, "dashboard:acme:ops", &[])
            .unwrap();

        let mut left = rooms.leave_all("s-1");
        left.sort();
        assert_eq!(left, vec!["dashboard:acme:ops", "org:acme"]);
        assert!(rooms.members("org:acme").is_empty());
        assert!(rooms.rooms_for("s-1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_respects_ttl() {
        let rooms = RoomManager::new(
            RoomConfig {
                ttl: Duration::from_secs(60),
                ..Default::default()
            },
            Arc::new(OrganizationPolicy),
        );
        let alice = member("alice", "acme");

        let empty = rooms
            .get_or_create_room(RoomScope::Dashboard, "acme", "ops")
            .unwrap();
        rooms.join_room("s-1", &alice, "org:acme", &[]).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(rooms.sweep().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(rooms.sweep(), vec![empty]);

        // Occupied rooms are never swept
        assert!(rooms.room_exists("org:acme"));
    }

    #[test]
    fn test_teardown_room() {
        let rooms = manager();
        let alice = member("alice", "acme");
        rooms
            .join_room("s-1", &alice, "dashboard:acme:ops", &[])
            .unwrap();

        assert_eq!(rooms.teardown_room("dashboard:acme:ops"), vec!["s-1"]);
        assert!(!rooms.is_member("s-1", "dashboard:acme:ops"));
        assert!(!rooms.room_exists("dashboard:acme:ops"));
    }

    #[test]
    fn test_stats() {
        let rooms = manager();
        rooms
            .join_room("s-1", &member("a", "acme"), "org:acme", &[])
            .unwrap();
        rooms
            .join_room("s-2", &member("b", "acme"), "org:acme", &[])
            .unwrap();
        rooms
            .get_or_create_room(RoomScope::Custom, "acme", "lobby")
            .unwrap();

        let stats = rooms.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.empty_rooms, 1);
        assert_eq!(stats.total_memberships, 2);
    }
}
