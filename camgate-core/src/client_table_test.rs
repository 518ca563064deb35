#[cfg(test)]
mod tests {
    use crate::client_table::ClientTable;
    use crate::error::ArbiterError;
    use crate::infrastructure::{NoopUsage, UsageObserver};
    use crate::types::{ClientDescriptor, ClientKind, DeviceId, Priority};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingUsage {
        added: Mutex<Vec<DeviceId>>,
        removed: Mutex<Vec<DeviceId>>,
    }

    impl UsageObserver for CountingUsage {
        fn client_added(&self, client: &ClientDescriptor) {
            self.added.lock().push(client.device_id().clone());
        }

        fn client_removed(&self, client: &ClientDescriptor) {
            self.removed.lock().push(client.device_id().clone());
        }
    }

    fn make_client(device: &str, owner: i32, conflicts: &[&str]) -> ClientDescriptor {
        ClientDescriptor::new(
            DeviceId::from(device),
            owner,
            10,
            conflicts.iter().map(|c| DeviceId::from(*c)).collect(),
            Priority::new(0, 0),
            ClientKind::Modern,
        )
    }

    fn create_table() -> ClientTable {
        ClientTable::new(Arc::new(NoopUsage))
    }

    #[test]
    fn test_insert_get_remove() {
        let table = create_table();
        table.insert(make_client("0", 5, &[])).unwrap();
        table.insert(make_client("1", 6, &[])).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&DeviceId::from("0")).unwrap().owner(), 5);

        let removed = table.remove(&DeviceId::from("0")).unwrap();
        assert_eq!(removed.owner(), 5);
        assert!(table.get(&DeviceId::from("0")).is_none());
        assert!(table.remove(&DeviceId::from("0")).is_none());
    }

    #[test]
    fn test_insert_refuses_conflicting_entry() {
        let table = create_table();
        table.insert(make_client("0", 5, &[])).unwrap();

        let err = table.insert(make_client("1", 6, &["0"])).unwrap_err();
        assert!(matches!(err, ArbiterError::InternalInconsistency { .. }));
        let err = table.insert(make_client("0", 7, &[])).unwrap_err();
        assert!(matches!(err, ArbiterError::InternalInconsistency { .. }));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_all_owned_by_and_owners() {
        let table = create_table();
        table.insert(make_client("0", 5, &[])).unwrap();
        table.insert(make_client("1", 6, &[])).unwrap();
        table.insert(make_client("2", 5, &[])).unwrap();

        let owned: Vec<String> = table
            .all_owned_by(5)
            .iter()
            .map(|c| c.device_id().to_string())
            .collect();
        assert_eq!(owned, vec!["0", "2"]);
        assert_eq!(table.lock().owners(), vec![5, 6]);
    }

    #[test]
    fn test_remove_client_matches_inserted_instance() {
        let table = create_table();
        let first = table.insert(make_client("0", 5, &[])).unwrap();
        assert!(table.remove_client(&first));

        // A later client on the same device is a different entry.
        table.insert(make_client("0", 6, &[])).unwrap();
        assert!(!table.remove_client(&first));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_update_priorities() {
        let table = create_table();
        table.insert(make_client("0", 5, &[])).unwrap();
        table.insert(make_client("1", 6, &[])).unwrap();

        let priorities = HashMap::from([(5, Priority::new(42, 1))]);
        table.lock().update_priorities(&priorities);

        assert_eq!(table.get(&DeviceId::from("0")).unwrap().priority(), Priority::new(42, 1));
        assert_eq!(table.get(&DeviceId::from("1")).unwrap().priority(), Priority::new(0, 0));
    }

    #[test]
    fn test_usage_observer_sees_inserts_and_removals() {
        let usage = Arc::new(CountingUsage::default());
        let table = ClientTable::new(usage.clone());
        table.insert(make_client("0", 5, &[])).unwrap();
        table.remove(&DeviceId::from("0"));

        assert_eq!(*usage.added.lock(), vec![DeviceId::from("0")]);
        assert_eq!(*usage.removed.lock(), vec![DeviceId::from("0")]);
    }

    // ============================================================
    // Removal acknowledgement
    // ============================================================

    #[test]
    fn test_wait_until_removed_times_out() {
        let table = create_table();
        let client = table.insert(make_client("0", 5, &[])).unwrap();
        assert!(!table.wait_until_removed(&client, Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_until_removed_wakes_on_removal() {
        let table = Arc::new(create_table());
        let client = table.insert(make_client("0", 5, &[])).unwrap();

        let remover = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                table.remove(&DeviceId::from("0"));
            })
        };

        assert!(table.wait_until_removed(&client, Duration::from_secs(5)));
        remover.join().unwrap();
    }

    #[test]
    fn test_guard_unlock_releases_table() {
        let table = create_table();
        let guard = table.lock();
        let table_ref = guard.unlock();
        // Would deadlock if the guard still held the lock.
        table_ref.insert(make_client("0", 5, &[])).unwrap();
        assert_eq!(table_ref.len(), 1);
    }
}
