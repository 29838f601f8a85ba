use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use gym_permissions::authz::{
    modules, privileges, ControllerConfig, ControllerState, Identity, PermissionController, PermissionStore,
    RoleId, StoreConfig,
};
use gym_permissions::fetcher::MemoryPermissionFetcher;
use gym_permissions::PermissionError;

const ROLE_7: RoleId = RoleId(7);
const ROLE_9: RoleId = RoleId(9);
const POLL: Duration = Duration::from_secs(30);

fn setup() -> (Arc<MemoryPermissionFetcher>, PermissionStore) {
    let fetcher = Arc::new(
        MemoryPermissionFetcher::new()
            .with_role(
                ROLE_7,
                vec![(
                    modules::CLIENTES,
                    vec![privileges::READ, privileges::CREATE, privileges::DELETE],
                )],
            )
            .with_role(ROLE_9, vec![(modules::CONTRATOS, vec![privileges::READ])]),
    );
    let store = PermissionStore::new(fetcher.clone(), StoreConfig::default());
    (fetcher, store)
}

fn controller(store: &PermissionStore) -> PermissionController {
    PermissionController::new(store.clone(), ControllerConfig { poll_interval: POLL })
}

#[tokio::test(start_paused = true)]
async fn two_controllers_share_one_fetch() -> Result<()> {
    let (fetcher, store) = setup();
    fetcher.set_latency(Duration::from_millis(100));
    let clients_screen = controller(&store);
    let contracts_screen = controller(&store);

    let (first, second) = tokio::join!(
        clients_screen.activate(Identity::with_role(ROLE_7)),
        contracts_screen.activate(Identity::with_role(ROLE_7)),
    );
    first?;
    second?;

    assert_eq!(fetcher.call_count(), 1);
    assert!(clients_screen.is_ready());
    assert!(contracts_screen.is_ready());
    assert_eq!(clients_screen.snapshot(), contracts_screen.snapshot());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn revoked_privilege_disappears_within_one_poll() -> Result<()> {
    let (fetcher, store) = setup();
    let screen = controller(&store);
    let mut snapshots = screen.subscribe();
    screen.activate(Identity::with_role(ROLE_7)).await?;
    let _ = snapshots.borrow_and_update();
    assert!(screen.has_privilege(modules::CLIENTES, privileges::DELETE));

    // an administrator edits role 7 while this session is open
    fetcher.revoke(ROLE_7, modules::CLIENTES, privileges::DELETE);
    tokio::time::sleep(POLL + Duration::from_secs(1)).await;

    assert!(!screen.has_privilege(modules::CLIENTES, privileges::DELETE));
    assert!(screen.has_all_privileges(modules::CLIENTES, &[privileges::READ, privileges::CREATE]));
    assert!(snapshots.has_changed()?);
    let latest = snapshots.borrow_and_update().clone();
    assert!(latest.is_ready);
    assert_eq!(latest.user_permissions.len(), 2);
    assert_eq!(latest.version, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn new_module_shows_up_for_every_screen() -> Result<()> {
    let (fetcher, store) = setup();
    let screens = [controller(&store), controller(&store), controller(&store)];
    for screen in &screens {
        screen.activate(Identity::with_role(ROLE_7)).await?;
    }

    fetcher.grant(ROLE_7, modules::REPORTES, privileges::READ);
    tokio::time::sleep(POLL + Duration::from_secs(1)).await;

    for screen in &screens {
        assert!(screen.has_module_access(modules::REPORTES));
        assert_eq!(
            screen.accessible_modules(),
            vec![modules::CLIENTES.to_string(), modules::REPORTES.to_string()]
        );
    }
    // one load, one poll per screen, and a single reload: the reloads coalesce
    assert!(fetcher.call_count() <= 1 + screens.len() + screens.len());
    assert_eq!(store.permissions_version(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failing_poll_keeps_permissions() -> Result<()> {
    let (fetcher, store) = setup();
    let screen = controller(&store);
    screen.activate(Identity::with_role(ROLE_7)).await?;

    fetcher.fail_always("server down");
    tokio::time::sleep(POLL * 3).await;

    assert!(screen.is_ready());
    assert!(screen.has_privilege(modules::CLIENTES, privileges::DELETE));
    // revalidation errors are not recorded; only reloads are
    assert!(screen.last_error().is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn poll_recovers_from_failed_first_load() -> Result<()> {
    let (fetcher, store) = setup();
    fetcher.fail_next("connection refused");
    let screen = controller(&store);

    assert!(screen.activate(Identity::with_role(ROLE_7)).await.is_err());
    assert!(!screen.is_ready());
    assert!(screen.last_error().is_some());
    assert!(!screen.has_module_access(modules::CLIENTES));

    tokio::time::sleep(POLL + Duration::from_secs(1)).await;
    assert!(screen.is_ready());
    assert!(screen.has_module_access(modules::CLIENTES));
    assert!(screen.last_error().is_none());
    Ok(())
}

#[tokio::test]
async fn role_change_rebinds_controller() -> Result<()> {
    let (fetcher, store) = setup();
    let screen = controller(&store);
    screen.activate(Identity::with_role(ROLE_7)).await?;
    assert!(screen.has_module_access(modules::CLIENTES));

    screen.activate(Identity::with_role(ROLE_9)).await?;
    assert_eq!(store.active_role(), Some(ROLE_9));
    assert!(!screen.has_module_access(modules::CLIENTES));
    assert!(screen.has_privilege(modules::CONTRATOS, privileges::READ));
    assert_eq!(fetcher.calls_for(ROLE_9), 1);

    // back to the same role that is already ready: no fetch
    screen.activate(Identity::with_role(ROLE_9)).await?;
    assert_eq!(fetcher.calls_for(ROLE_9), 1);
    Ok(())
}

#[tokio::test]
async fn logout_denies_everything() -> Result<()> {
    let (_, store) = setup();
    let screen = controller(&store);
    screen.activate(Identity::with_role(ROLE_7)).await?;

    store.reset();
    assert!(!screen.is_ready());
    assert!(!screen.has_module_access(modules::CLIENTES));

    let err = screen.activate(Identity::anonymous()).await.unwrap_err();
    assert_eq!(err, PermissionError::NotAuthenticated);
    assert!(!screen.has_module_access(modules::CLIENTES));
    assert_eq!(screen.refresh_permissions().await.unwrap_err(), PermissionError::NotAuthenticated);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deactivated_controller_stops_polling() -> Result<()> {
    let (fetcher, store) = setup();
    let screen = controller(&store);
    screen.activate(Identity::with_role(ROLE_7)).await?;
    screen.deactivate();
    assert_eq!(screen.state(), ControllerState::Unsubscribed);

    tokio::time::sleep(POLL * 4).await;
    assert_eq!(fetcher.call_count(), 1);
    // the store itself stays loaded for other consumers
    assert!(store.is_ready_for(ROLE_7));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn activation_overlapping_refresh_succeeds() -> Result<()> {
    let (fetcher, store) = setup();
    fetcher.set_latency(Duration::from_millis(500));
    let screen = Arc::new(controller(&store));

    let activating = tokio::spawn({
        let screen = screen.clone();
        async move { screen.activate(Identity::with_role(ROLE_7)).await }
    });
    tokio::task::yield_now().await;

    screen.refresh_permissions().await?;
    activating.await??;

    assert!(screen.is_ready());
    assert!(store.is_ready_for(ROLE_7));
    assert!(screen.has_privilege(modules::CLIENTES, privileges::DELETE));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn predicates_never_answer_from_another_roles_matrix() -> Result<()> {
    let (fetcher, store) = setup();
    fetcher.set_latency(Duration::from_millis(1));
    let screen = Arc::new(controller(&store));
    screen.activate(Identity::with_role(ROLE_7)).await?;

    let done = Arc::new(AtomicBool::new(false));
    let leaks = Arc::new(AtomicUsize::new(0));
    let mut readers = Vec::new();
    for _ in 0..3 {
        let screen = screen.clone();
        let done = done.clone();
        let leaks = leaks.clone();
        readers.push(tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                // CONTRATOS is only granted to role 9
                if screen.has_module_access(modules::CONTRATOS)
                    || screen.has_privilege(modules::CONTRATOS, privileges::READ)
                {
                    leaks.fetch_add(1, Ordering::SeqCst);
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for round in 0..40 {
        let role = if round % 2 == 0 { ROLE_9 } else { ROLE_7 };
        store.initialize(role).await?;
    }
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.await?;
    }

    assert_eq!(leaks.load(Ordering::SeqCst), 0);
    assert!(screen.has_module_access(modules::CLIENTES));
    Ok(())
}
