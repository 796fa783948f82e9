// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Auditing for reservations no chain will ever finish

use crate::common::test_setup;
use crate::common::vm_params;
use crate::common::HOST_SMALL;
use cirrus_capacity::ReservationState;
use cirrus_uuid_kinds::ChainUuid;

#[tokio::test]
async fn test_orphaned_reservations() {
    let cptestctx = test_setup("test_orphaned_reservations").await;
    let orchestrator = &cptestctx.orchestrator;
    let before = cptestctx.snapshots();

    let instance =
        orchestrator.create_vm(&vm_params("audited", 1024, 10)).await.unwrap();
    assert!(orchestrator.orphaned_reservations().is_empty());

    // A reservation made on behalf of a chain the executor never ran.
    let host_id = cptestctx.host_id(HOST_SMALL);
    let leaked = orchestrator
        .tracker()
        .reserve(host_id, 512, ChainUuid::new_v4())
        .unwrap();
    assert_eq!(orchestrator.orphaned_reservations(), vec![leaked.clone()]);
    assert_eq!(cptestctx.capacity(host_id).reserved, 512);

    let released = orchestrator.release_orphans();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].id, leaked.id);
    assert_eq!(released[0].state, ReservationState::Released);
    assert_eq!(cptestctx.capacity(host_id).reserved, 0);
    assert!(orchestrator.orphaned_reservations().is_empty());
    assert!(orchestrator.release_orphans().is_empty());

    orchestrator.destroy_vm(instance.id).await.unwrap();
    assert_eq!(cptestctx.snapshots(), before);
    cptestctx.teardown().await;
}
