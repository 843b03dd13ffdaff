//! Name ownership over real connections: claims, queueing, replacement and
//! the cleanup that follows a disconnect.

mod common;

use std::sync::Arc;

use common::{Recorder, attach, count_queued, shutdown, signal_named, started_router};
use meshbus_core::bus::{
    NameOwnerChangedArgs, ReleaseNameCode, RequestNameCode, WellKnownNameArgs, error_names,
    member, name_flags,
};
use meshbus_core::{BusName, WellKnownName};
use meshbus_router::{BusEvent, RouterConfig, RouterError};

const OWNER_CHANGES: &str = "type='signal',interface='org.meshbus.Bus',member='NameOwnerChanged'";

fn svc() -> WellKnownName {
    "svc.example".parse().unwrap()
}

fn assert_no_owner(result: Result<meshbus_core::UniqueName, RouterError>) {
    match result {
        Err(RouterError::ErrorReply { name, .. }) => assert_eq!(name, error_names::NAME_HAS_NO_OWNER),
        other => panic!("expected NameHasNoOwner, got {other:?}"),
    }
}

#[tokio::test]
async fn owner_disconnect_clears_the_name_and_notifies_once() {
    let router = started_router(RouterConfig::default()).await;
    let recorder = Arc::new(Recorder::default());
    router.register_listener(recorder.clone());

    let a = attach(&router).await;
    let b = attach(&router).await;
    b.add_match(OWNER_CHANGES).await.unwrap();

    assert_eq!(a.request_name(&svc(), 0).await.unwrap(), RequestNameCode::PrimaryOwner);
    let acquired: WellKnownNameArgs = signal_named(&a, member::NAME_ACQUIRED).await.args().unwrap();
    assert_eq!(acquired.name, svc());

    let claimed: NameOwnerChangedArgs =
        signal_named(&b, member::NAME_OWNER_CHANGED).await.args().unwrap();
    assert_eq!(claimed.old_owner, None);
    assert_eq!(claimed.new_owner.as_ref(), Some(a.unique_name()));

    assert_eq!(&b.get_name_owner(svc()).await.unwrap(), a.unique_name());
    assert!(b.name_has_owner(svc()).await.unwrap());

    let a_name = a.unique_name().clone();
    a.disconnect().await;

    let released: NameOwnerChangedArgs =
        signal_named(&b, member::NAME_OWNER_CHANGED).await.args().unwrap();
    assert_eq!(released.name, svc());
    assert_eq!(released.old_owner.as_ref(), Some(&a_name));
    assert_eq!(released.new_owner, None);

    assert_no_owner(b.get_name_owner(svc()).await);
    assert!(!b.name_has_owner(svc()).await.unwrap());
    assert_eq!(router.resolve_name(&BusName::from(svc())), None);
    // Replies travel behind any signal queued before them.
    assert_eq!(count_queued(&b, member::NAME_OWNER_CHANGED), 0);

    shutdown(&router).await;
    let releases = recorder
        .events()
        .into_iter()
        .filter(|e| {
            *e == BusEvent::NameOwnerChanged {
                name: svc(),
                old_owner: Some(a_name.clone()),
                new_owner: None,
            }
        })
        .count();
    assert_eq!(releases, 1);
}

#[tokio::test]
async fn queued_claimant_is_promoted_on_release() {
    let router = started_router(RouterConfig::default()).await;
    let recorder = Arc::new(Recorder::default());
    router.register_listener(recorder.clone());
    let a = attach(&router).await;
    let b = attach(&router).await;

    assert_eq!(a.request_name(&svc(), 0).await.unwrap(), RequestNameCode::PrimaryOwner);
    assert_eq!(a.request_name(&svc(), 0).await.unwrap(), RequestNameCode::AlreadyOwner);
    assert_eq!(b.request_name(&svc(), 0).await.unwrap(), RequestNameCode::InQueue);
    assert_eq!(
        b.list_queued_owners(svc()).await.unwrap(),
        vec![a.unique_name().clone(), b.unique_name().clone()]
    );

    assert_eq!(a.release_name(&svc()).await.unwrap(), ReleaseNameCode::Released);
    signal_named(&a, member::NAME_LOST).await;
    signal_named(&b, member::NAME_ACQUIRED).await;
    assert_eq!(&a.get_name_owner(svc()).await.unwrap(), b.unique_name());

    assert_eq!(a.release_name(&svc()).await.unwrap(), ReleaseNameCode::NotOwner);
    let unknown: WellKnownName = "svc.unknown".parse().unwrap();
    assert_eq!(a.release_name(&unknown).await.unwrap(), ReleaseNameCode::NonExistent);

    shutdown(&router).await;
    assert!(recorder.events().contains(&BusEvent::NameQueued {
        name: svc(),
        endpoint: b.unique_name().clone(),
    }));
}

#[tokio::test]
async fn replacement_demotes_the_owner_to_the_queue() {
    let router = started_router(RouterConfig::default()).await;
    let a = attach(&router).await;
    let b = attach(&router).await;
    let c = attach(&router).await;

    a.request_name(&svc(), name_flags::ALLOW_REPLACEMENT).await.unwrap();
    assert_eq!(b.request_name(&svc(), 0).await.unwrap(), RequestNameCode::InQueue);
    assert_eq!(
        c.request_name(&svc(), name_flags::REPLACE_EXISTING).await.unwrap(),
        RequestNameCode::PrimaryOwner
    );
    signal_named(&a, member::NAME_LOST).await;
    assert_eq!(
        c.list_queued_owners(svc()).await.unwrap(),
        vec![c.unique_name().clone(), b.unique_name().clone(), a.unique_name().clone()]
    );

    // The new owner did not allow replacement, so a second takeover fails.
    assert_eq!(
        a.request_name(&svc(), name_flags::REPLACE_EXISTING | name_flags::DO_NOT_QUEUE)
            .await
            .unwrap(),
        RequestNameCode::Exists
    );
    assert_eq!(
        c.list_queued_owners(svc()).await.unwrap(),
        vec![c.unique_name().clone(), b.unique_name().clone()]
    );
    shutdown(&router).await;
}

#[tokio::test]
async fn list_names_includes_unique_and_well_known_names() {
    let router = started_router(RouterConfig::default()).await;
    let a = attach(&router).await;
    a.request_name(&svc(), 0).await.unwrap();

    let names = a.list_names().await.unwrap();
    assert!(names.contains(&BusName::from(a.unique_name().clone())));
    assert!(names.contains(&BusName::from(svc())));
    assert_eq!(router.list_names(), names);
    shutdown(&router).await;
}

#[tokio::test]
async fn the_bus_name_cannot_be_claimed() {
    let router = started_router(RouterConfig::default()).await;
    let a = attach(&router).await;
    let bus: WellKnownName = meshbus_core::bus::BUS_NAME.parse().unwrap();
    match a.request_name(&bus, 0).await {
        Err(RouterError::ErrorReply { name, .. }) => assert_eq!(name, error_names::ACCESS_DENIED),
        other => panic!("expected AccessDenied, got {other:?}"),
    }
    shutdown(&router).await;
}
