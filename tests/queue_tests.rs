// SPDX-License-Identifier: Apache-2.0

//! Integration tests driving the public queue API across handles, the
//! way separate processes would use it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shq::{Config, Event, Mode, QueueRegistry, SharedQueue, ShqError, TypeTag};

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "shq-it-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[test]
fn test_content_is_shared_across_handles() {
    let name = unique_name("shared");
    let writer = SharedQueue::create(&name, 16, Mode::WriteOnly).unwrap();
    let reader = SharedQueue::open(&name, Mode::ReadOnly).unwrap();

    writer.add(b"one").unwrap();
    writer.addv(&[(TypeTag::Ascii, b"two"), (TypeTag::Ascii, b"three")])
        .unwrap();
    assert_eq!(reader.count(), 2);

    let first = reader.remove().unwrap().unwrap();
    assert_eq!(first.bytes(), b"one");
    assert_eq!(first.tag, TypeTag::Stream);

    let second = reader.remove().unwrap().unwrap();
    assert!(second.is_vector());
    assert_eq!(second.values.len(), 2);
    assert_eq!(second.values[1].bytes, b"three");

    // Removal is destructive: nothing left for anyone.
    assert_eq!(reader.remove().unwrap(), None);
    writer.close();
    reader.destroy().unwrap();
}

#[test]
fn test_queue_survives_handle_churn() {
    let name = unique_name("churn");
    {
        let q = SharedQueue::create(&name, 8, Mode::ReadWrite).unwrap();
        q.add_typed(TypeTag::Integer, &7i64.to_le_bytes()).unwrap();
        // Dropped without destroy: content must persist.
    }
    assert!(SharedQueue::is_valid(&name));

    let q = SharedQueue::open(&name, Mode::ReadWrite).unwrap();
    assert_eq!(q.count(), 1);
    let item = q.remove().unwrap().unwrap();
    assert_eq!(item.tag, TypeTag::Integer);
    assert_eq!(i64::from_le_bytes(item.bytes().try_into().unwrap()), 7);
    q.destroy().unwrap();
    assert!(!SharedQueue::is_valid(&name));
}

#[test]
fn test_create_collision_and_open_missing() {
    let name = unique_name("collide");
    let q = SharedQueue::create(&name, 4, Mode::ReadWrite).unwrap();
    assert!(matches!(
        SharedQueue::create(&name, 4, Mode::ReadWrite),
        Err(ShqError::AlreadyExists { .. })
    ));
    q.destroy().unwrap();

    assert!(matches!(
        SharedQueue::open(&name, Mode::ReadOnly),
        Err(ShqError::NotFound { .. })
    ));
}

#[test]
fn test_add_timedwait_blocks_until_space() {
    let name = unique_name("space");
    let q = Arc::new(SharedQueue::create(&name, 2, Mode::ReadWrite).unwrap());
    q.add(b"a").unwrap();
    q.add(b"b").unwrap();

    // Zero deadline is a pure probe.
    assert!(matches!(
        q.add_timedwait(b"c", Duration::ZERO),
        Err(ShqError::DepthLimitReached { .. })
    ));

    let producer = {
        let q = Arc::clone(&q);
        thread::spawn(move || q.add_timedwait(b"c", Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(q.remove().unwrap().unwrap().bytes(), b"a");

    producer.join().unwrap().unwrap();
    assert_eq!(q.remove().unwrap().unwrap().bytes(), b"b");
    assert_eq!(q.remove().unwrap().unwrap().bytes(), b"c");
    Arc::try_unwrap(q).map_err(|_| ()).unwrap().destroy().unwrap();
}

#[test]
fn test_depth_limit_scenario_with_adaptive_lifo() {
    let name = unique_name("scenario");
    let q = SharedQueue::create(&name, 2, Mode::ReadWrite).unwrap();
    q.subscribe(Event::Limit).unwrap();

    q.add(b"a").unwrap();
    q.add(b"b").unwrap();
    assert_eq!(q.active_event(), Event::Limit);
    assert!(matches!(
        q.add(b"c"),
        Err(ShqError::DepthLimitReached { max_depth: 2 })
    ));

    q.set_adaptive_lifo(true).unwrap();
    let start = Instant::now();
    q.add_wait(b"c").unwrap();
    // The LIFO path admits the item immediately, no block.
    assert!(start.elapsed() < Duration::from_millis(200));
    assert_eq!(q.count(), 3);

    assert_eq!(q.remove().unwrap().unwrap().bytes(), b"c");
    assert_eq!(q.remove().unwrap().unwrap().bytes(), b"a");
    assert_eq!(q.remove().unwrap().unwrap().bytes(), b"b");
    q.destroy().unwrap();
}

#[test]
fn test_event_lifecycle_observed_from_second_handle() {
    let name = unique_name("events");
    let q = SharedQueue::create(&name, 8, Mode::ReadWrite).unwrap();
    let observer = SharedQueue::open(&name, Mode::Immutable).unwrap();

    // Subscriptions are queue state, visible to every handle.
    q.subscribe(Event::All).unwrap();
    assert!(observer.is_subscribed(Event::Empty));

    q.add(b"x").unwrap();
    assert_eq!(observer.active_event(), Event::Init);
    assert_eq!(observer.active_event(), Event::Nonempty);
    q.remove().unwrap().unwrap();
    assert_eq!(observer.active_event(), Event::Empty);
    assert_eq!(observer.active_event(), Event::None);

    observer.close();
    q.destroy().unwrap();
}

#[test]
fn test_level_event_fires_at_threshold() {
    let name = unique_name("level");
    let q = SharedQueue::create(&name, 8, Mode::ReadWrite).unwrap();
    q.set_level(2).unwrap();
    q.subscribe(Event::Level).unwrap();

    q.add(b"1").unwrap();
    assert_eq!(q.active_event(), Event::None);
    q.add(b"2").unwrap();
    assert_eq!(q.active_event(), Event::Level);
    q.add(b"3").unwrap();
    assert_eq!(q.active_event(), Event::None);
    q.destroy().unwrap();
}

#[test]
fn test_expired_items_discarded_across_handles() {
    let name = unique_name("expire");
    let producer = SharedQueue::create(&name, 8, Mode::ReadWrite).unwrap();
    producer.set_time_limit(Duration::from_millis(20)).unwrap();
    producer.set_discard(true).unwrap();
    producer.add(b"stale").unwrap();

    thread::sleep(Duration::from_millis(50));

    let consumer = SharedQueue::open(&name, Mode::ReadOnly).unwrap();
    assert_eq!(consumer.remove().unwrap(), None);
    assert_eq!(consumer.count(), 0);

    consumer.close();
    producer.destroy().unwrap();
}

#[test]
fn test_idle_time_and_last_empty_timestamp() {
    let name = unique_name("idle");
    let q = SharedQueue::create(&name, 8, Mode::ReadWrite).unwrap();
    let created = q.last_empty_timestamp();

    assert!(!q.exceeds_idle_time(Duration::from_secs(60)));
    thread::sleep(Duration::from_millis(30));
    assert!(q.exceeds_idle_time(Duration::from_millis(10)));

    q.add(b"x").unwrap();
    assert!(q.last_empty_timestamp() > created);
    assert!(!q.exceeds_idle_time(Duration::from_millis(10)));
    q.destroy().unwrap();
}

#[test]
fn test_delay_exceeded_under_sustained_backlog() {
    let name = unique_name("codel");
    let q = SharedQueue::create(&name, 8, Mode::ReadWrite).unwrap();
    q.set_target_delay(Duration::from_millis(10)).unwrap();
    q.subscribe(Event::Time).unwrap();
    assert!(!q.delay_exceeded());

    q.add(b"old").unwrap();
    // Sojourn observations happen on queue traffic; feed some while the
    // head lingers past the target for a full interval.
    thread::sleep(Duration::from_millis(15));
    q.add(b"more").unwrap();
    thread::sleep(Duration::from_millis(15));
    q.add(b"more").unwrap();

    assert!(q.delay_exceeded());
    assert_eq!(q.active_event(), Event::Time);

    // Draining clears the backpressure signal.
    while q.remove().unwrap().is_some() {}
    q.add(b"fresh").unwrap();
    assert!(!q.delay_exceeded());
    q.destroy().unwrap();
}

#[test]
fn test_registry_with_config_provisioning() {
    let name = unique_name("cfg");
    let yaml = format!(
        "queues:\n  - name: {}\n    max_depth: 16\n    level: 8\n    discard: true\n    subscribe: [empty, nonempty]\n",
        name
    );
    let cfg = Config::from_yaml(&yaml).unwrap();
    let provisioned = cfg.provision_all().unwrap();
    assert_eq!(provisioned.len(), 1);

    let registry = QueueRegistry::new();
    let handle = registry.attach(&name, Mode::ReadWrite).unwrap();
    assert!(handle.will_discard());
    assert!(handle.is_subscribed(Event::Nonempty));
    assert_eq!(handle.max_depth(), 16);

    drop(handle);
    provisioned
        .into_iter()
        .next()
        .unwrap()
        .destroy()
        .unwrap();
}

#[test]
fn test_pipeline_two_stages() {
    let ingress = unique_name("stage1");
    let egress = unique_name("stage2");
    let q_in = Arc::new(SharedQueue::create(&ingress, 32, Mode::ReadWrite).unwrap());
    let q_out = Arc::new(SharedQueue::create(&egress, 32, Mode::ReadWrite).unwrap());

    let relay = {
        let q_in = Arc::clone(&q_in);
        let q_out = Arc::clone(&q_out);
        thread::spawn(move || {
            for _ in 0..100 {
                let item = q_in.remove_wait().unwrap().unwrap();
                let n = u64::from_le_bytes(item.bytes().try_into().unwrap());
                q_out.add_wait(&(n * 2).to_le_bytes()).unwrap();
            }
        })
    };

    for i in 0..100u64 {
        q_in.add_wait(&i.to_le_bytes()).unwrap();
    }

    let mut total = 0u64;
    for _ in 0..100 {
        let item = q_out.remove_wait().unwrap().unwrap();
        total += u64::from_le_bytes(item.bytes().try_into().unwrap());
    }
    relay.join().unwrap();

    assert_eq!(total, (0..100u64).map(|i| i * 2).sum());
    Arc::try_unwrap(q_in).map_err(|_| ()).unwrap().destroy().unwrap();
    Arc::try_unwrap(q_out).map_err(|_| ()).unwrap().destroy().unwrap();
}
