//! The authoritative in-memory table of mount points and their subscriber
//! fan-out sets. Owned exclusively by the reactor task; no internal locking
//! since no other task ever touches it directly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::codec::haversine_meters;
use crate::connection::ConnId;
use crate::error::CasterError;

/// A registered mount point: one publisher, any number of subscribers.
pub struct MountPoint {
    pub name: String,
    pub publisher: ConnId,
    pub username: String,
    pub password: String,
    pub position: Option<(f64, f64)>,
    pub advertisement: String,
    pub subscribers: HashMap<ConnId, mpsc::Sender<Arc<[u8]>>>,
}

impl MountPoint {
    fn credentials_match(&self, user: &str, pass: &str) -> bool {
        self.username == user && self.password == pass
    }
}

/// The caster's live mount-point table.
#[derive(Default)]
pub struct Registry {
    mounts: HashMap<String, MountPoint>,
    /// Registration order, for stable `nearest()` tie-breaking and
    /// source-table ordering.
    order: Vec<String>,
    by_publisher: HashMap<ConnId, String>,
    by_subscriber: HashMap<ConnId, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new mount point. Fails with `NameInUse` if the name is
    /// already taken by a live publisher.
    #[allow(clippy::too_many_arguments)]
    pub fn add_mount(
        &mut self,
        name: String,
        username: String,
        password: String,
        position: Option<(f64, f64)>,
        advertisement: String,
        publisher_id: ConnId,
    ) -> Result<(), CasterError> {
        if self.mounts.contains_key(&name) {
            return Err(CasterError::NameInUse);
        }

        self.by_publisher.insert(publisher_id, name.clone());
        self.order.push(name.clone());
        self.mounts.insert(
            name.clone(),
            MountPoint {
                name,
                publisher: publisher_id,
                username,
                password,
                position,
                advertisement,
                subscribers: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Remove the mount point owned by `publisher_id`, if any, returning it
    /// so the caller can tear down its subscribers.
    pub fn remove_mount(&mut self, publisher_id: ConnId) -> Option<MountPoint> {
        let name = self.by_publisher.remove(&publisher_id)?;
        self.order.retain(|n| n != &name);
        let mount = self.mounts.remove(&name)?;
        for sub_id in mount.subscribers.keys() {
            self.by_subscriber.remove(sub_id);
        }
        Some(mount)
    }

    /// Attach a subscriber to `name`, after verifying credentials.
    pub fn attach_subscriber(
        &mut self,
        name: &str,
        username: &str,
        password: &str,
        subscriber_id: ConnId,
        sender: mpsc::Sender<Arc<[u8]>>,
    ) -> Result<(), CasterError> {
        let mount = self.mounts.get_mut(name).ok_or(CasterError::NotFound)?;
        if !mount.credentials_match(username, password) {
            return Err(CasterError::Auth);
        }
        mount.subscribers.insert(subscriber_id, sender);
        self.by_subscriber.insert(subscriber_id, name.to_string());
        Ok(())
    }

    /// Detach a subscriber from whichever mount it belongs to, if any.
    pub fn detach_subscriber(&mut self, subscriber_id: ConnId) {
        if let Some(name) = self.by_subscriber.remove(&subscriber_id) {
            if let Some(mount) = self.mounts.get_mut(&name) {
                mount.subscribers.remove(&subscriber_id);
            }
        }
    }

    /// Look up a mount by exact name.
    pub fn get(&self, name: &str) -> Option<&MountPoint> {
        self.mounts.get(name)
    }

    /// Among mounts with a known position, the one minimizing Haversine
    /// distance to `position`; ties broken by first-registered.
    pub fn nearest(&self, position: (f64, f64)) -> Option<&str> {
        let mut best: Option<(&str, f64)> = None;
        for name in &self.order {
            let mount = self.mounts.get(name)?;
            let Some(mount_pos) = mount.position else {
                continue;
            };
            let distance = haversine_meters(position, mount_pos);
            match best {
                Some((_, best_distance)) if distance >= best_distance => {},
                _ => best = Some((name.as_str(), distance)),
            }
        }
        best.map(|(name, _)| name)
    }

    /// Concatenation of all advertisement strings, in registration order.
    pub fn source_table_text(&self) -> String {
        let mut out = String::new();
        for name in &self.order {
            if let Some(mount) = self.mounts.get(name) {
                out.push_str(&mount.advertisement);
            }
        }
        out
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnIdGenerator;

    fn ids() -> ConnIdGenerator {
        ConnIdGenerator::new()
    }

    #[test]
    fn test_uniqueness_after_add_remove_sequence() {
        let gen = ids();
        let mut reg = Registry::new();
        let p1 = gen.next();
        let p2 = gen.next();

        reg.add_mount(
            "RTK01".to_string(),
            "user1".to_string(),
            "pass1".to_string(),
            None,
            "STR;RTK01;\r\n".to_string(),
            p1,
        )
        .unwrap();

        assert!(matches!(
            reg.add_mount(
                "RTK01".to_string(),
                "user2".to_string(),
                "pass2".to_string(),
                None,
                "STR;RTK01;\r\n".to_string(),
                p2,
            ),
            Err(CasterError::NameInUse)
        ));

        reg.remove_mount(p1);
        reg.add_mount(
            "RTK01".to_string(),
            "user2".to_string(),
            "pass2".to_string(),
            None,
            "STR;RTK01;\r\n".to_string(),
            p2,
        )
        .unwrap();

        assert_eq!(reg.mount_count(), 1);
    }

    #[test]
    fn test_attach_subscriber_auth_and_missing_mount() {
        let gen = ids();
        let mut reg = Registry::new();
        let publisher = gen.next();
        reg.add_mount(
            "RTK01".to_string(),
            "user1".to_string(),
            "pass1".to_string(),
            None,
            String::new(),
            publisher,
        )
        .unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let sub = gen.next();
        assert!(reg
            .attach_subscriber("RTK01", "user1", "wrong", sub, tx.clone())
            .is_err());
        assert!(reg.attach_subscriber("nosuch", "user1", "pass1", sub, tx.clone()).is_err());
        reg.attach_subscriber("RTK01", "user1", "pass1", sub, tx).unwrap();
        assert_eq!(reg.get("RTK01").unwrap().subscribers.len(), 1);

        reg.detach_subscriber(sub);
        assert_eq!(reg.get("RTK01").unwrap().subscribers.len(), 0);
    }

    #[test]
    fn test_remove_mount_detaches_all_subscribers() {
        let gen = ids();
        let mut reg = Registry::new();
        let publisher = gen.next();
        reg.add_mount(
            "RTK01".to_string(),
            "user1".to_string(),
            "pass1".to_string(),
            None,
            String::new(),
            publisher,
        )
        .unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let sub = gen.next();
        reg.attach_subscriber("RTK01", "user1", "pass1", sub, tx).unwrap();

        let removed = reg.remove_mount(publisher).unwrap();
        assert_eq!(removed.subscribers.len(), 1);
        assert!(reg.get("RTK01").is_none());

        // The reverse index must be cleared too, or a later re-registration
        // under the same name could see a phantom subscriber.
        reg.add_mount(
            "RTK01".to_string(),
            "user1".to_string(),
            "pass1".to_string(),
            None,
            String::new(),
            gen.next(),
        )
        .unwrap();
        assert_eq!(reg.get("RTK01").unwrap().subscribers.len(), 0);
    }

    #[test]
    fn test_nearest_picks_closest_with_position() {
        let gen = ids();
        let mut reg = Registry::new();
        reg.add_mount(
            "A".to_string(),
            "u".to_string(),
            "p".to_string(),
            Some((37.80, -122.40)),
            String::new(),
            gen.next(),
        )
        .unwrap();
        reg.add_mount(
            "B".to_string(),
            "u".to_string(),
            "p".to_string(),
            Some((37.60, -122.40)),
            String::new(),
            gen.next(),
        )
        .unwrap();
        reg.add_mount(
            "C".to_string(),
            "u".to_string(),
            "p".to_string(),
            None,
            String::new(),
            gen.next(),
        )
        .unwrap();

        assert_eq!(reg.nearest((37.78, -122.40)), Some("A"));
        assert_eq!(reg.nearest((37.62, -122.40)), Some("B"));
    }

    #[test]
    fn test_nearest_none_when_no_positioned_mount() {
        let gen = ids();
        let mut reg = Registry::new();
        reg.add_mount(
            "A".to_string(),
            "u".to_string(),
            "p".to_string(),
            None,
            String::new(),
            gen.next(),
        )
        .unwrap();
        assert_eq!(reg.nearest((0.0, 0.0)), None);
    }

    #[test]
    fn test_source_table_text_registration_order() {
        let gen = ids();
        let mut reg = Registry::new();
        reg.add_mount(
            "A".to_string(),
            "u".to_string(),
            "p".to_string(),
            None,
            "STR;A;\r\n".to_string(),
            gen.next(),
        )
        .unwrap();
        reg.add_mount(
            "B".to_string(),
            "u".to_string(),
            "p".to_string(),
            None,
            "STR;B;\r\n".to_string(),
            gen.next(),
        )
        .unwrap();
        assert_eq!(reg.source_table_text(), "STR;A;\r\nSTR;B;\r\n");
    }
}
