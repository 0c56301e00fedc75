use crate::{
    serialize_object_graph, BincodeDeserializer, ContentLoader, LoaderConfig, RamContentStore,
    SceneHost, SceneInstantiateInfo,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stowage_base::{
    ContentError, ContentFile, ContentLoadProvider, ContentNamespace, ContentObject,
    ContentSceneFile, ContentSceneParameters, DependencyFence, IntegrationError, LoadFailure,
    LoadHandle, LoadingStatus, LocalId, ObjectGraph, ObjectRef, ObjectTypeId, SceneHandle,
    SceneLoadingStatus,
};
use uuid::Uuid;

const WAIT_TIMEOUT_MS: u64 = 5000;

fn mesh_type() -> ObjectTypeId {
    ObjectTypeId(Uuid::parse_str("e1b2d7b8-4c7e-4b5d-9d52-3b7a0c1f2e44").unwrap())
}

fn object(
    local_id: u64,
    references: Vec<ObjectRef>,
) -> ContentObject {
    ContentObject {
        local_id: LocalId(local_id),
        type_id: mesh_type(),
        name: format!("object_{}", local_id),
        payload: local_id.to_le_bytes().to_vec(),
        references,
    }
}

fn graph_bytes(objects: Vec<ContentObject>) -> Vec<u8> {
    serialize_object_graph(&ObjectGraph::new(objects).unwrap()).unwrap()
}

fn namespace() -> ContentNamespace {
    ContentNamespace::default_namespace()
}

fn create_loader(config: LoaderConfig) -> (ContentLoader, Arc<RamContentStore>) {
    let store = Arc::new(RamContentStore::default());
    let loader = ContentLoader::new(
        config,
        Box::new(store.clone()),
        Box::new(BincodeDeserializer),
    )
    .unwrap();
    (loader, store)
}

fn default_loader() -> (ContentLoader, Arc<RamContentStore>) {
    create_loader(LoaderConfig::default())
}

fn insert_simple_file(
    store: &RamContentStore,
    filename: &str,
) {
    store.insert(
        &namespace(),
        filename,
        graph_bytes(vec![
            object(1, vec![ObjectRef::Local(LocalId(2))]),
            object(2, vec![]),
        ]),
    );
}

fn wait(
    loader: &ContentLoader,
    load_handle: LoadHandle,
) {
    assert!(loader
        .wait_for_completion(load_handle, WAIT_TIMEOUT_MS)
        .unwrap());
}

fn manual_scene() -> ContentSceneParameters {
    ContentSceneParameters {
        auto_integrate: false,
        ..Default::default()
    }
}

#[derive(Default)]
struct RecordingSceneHost {
    next_scene: u64,
    instantiated: Vec<String>,
    attached: Vec<SceneHandle>,
    detached: Vec<SceneHandle>,
    discarded: Vec<SceneHandle>,
    refuse_to_attach: Vec<String>,
    instantiate_delay: Duration,
}

impl SceneHost for RecordingSceneHost {
    fn instantiate(
        &mut self,
        objects: &ObjectGraph,
        info: &SceneInstantiateInfo,
    ) -> Result<SceneHandle, IntegrationError> {
        if !self.instantiate_delay.is_zero() {
            std::thread::sleep(self.instantiate_delay);
        }

        if let Some(object) = objects.objects().iter().find(|x| x.type_id != mesh_type()) {
            return Err(IntegrationError::new(format!(
                "Unknown object type {:?}",
                object.type_id
            )));
        }

        self.next_scene += 1;
        self.instantiated.push(info.scene_name.to_string());
        Ok(SceneHandle(self.next_scene))
    }

    fn attach(
        &mut self,
        scene: SceneHandle,
    ) -> Result<(), IntegrationError> {
        let scene_name = &self.instantiated[scene.0 as usize - 1];
        if self.refuse_to_attach.contains(scene_name) {
            return Err(IntegrationError::new("attach refused"));
        }

        self.attached.push(scene);
        Ok(())
    }

    fn detach(
        &mut self,
        scene: SceneHandle,
    ) {
        self.attached.retain(|x| *x != scene);
        self.detached.push(scene);
    }

    fn discard(
        &mut self,
        scene: SceneHandle,
    ) {
        self.discarded.push(scene);
    }
}

#[test]
fn load_file() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");

    let file = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    assert!(file.is_valid(&loader));
    assert!(file.wait_for_completion(&loader, WAIT_TIMEOUT_MS).unwrap());
    assert_eq!(file.loading_status(&loader).unwrap(), LoadingStatus::Completed);

    let objects = file.objects(&loader).unwrap();
    assert_eq!(objects.len(), 2);
    assert_eq!(file.object(&loader, LocalId(2)).unwrap().name, "object_2");
    assert!(matches!(
        file.object(&loader, LocalId(3)),
        Err(ContentError::NotFound(LocalId(3)))
    ));
}

#[test]
fn missing_file_fails() {
    let (loader, _store) = default_loader();
    let file = loader
        .load_file_async(&namespace(), "missing.bin", &[], DependencyFence::NONE)
        .unwrap();
    wait(&loader, file.0);

    assert_eq!(loader.loading_status(file).unwrap(), LoadingStatus::Failed);
    match loader.objects(file) {
        Err(ContentError::OperationFailed(LoadFailure::Io(e))) => {
            assert_eq!(e.kind(), std::io::ErrorKind::NotFound)
        }
        other => panic!("unexpected result {:?}", other),
    }

    // Failed operations keep their handle until unloaded
    assert!(loader.is_valid(file.0));
}

#[test]
fn corrupt_file_fails_with_format_error() {
    let (loader, store) = default_loader();
    store.insert(&namespace(), "corrupt.bin", vec![0xff, 0xff, 0xff]);
    let file = loader
        .load_file_async(&namespace(), "corrupt.bin", &[], DependencyFence::NONE)
        .unwrap();
    wait(&loader, file.0);
    assert!(matches!(
        loader.objects(file),
        Err(ContentError::OperationFailed(LoadFailure::Format(_)))
    ));
}

#[test]
fn data_is_not_available_before_completion() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");
    let fence = loader.issue_fence();

    let file = loader
        .load_file_async(&namespace(), "a.bin", &[], fence)
        .unwrap();
    assert!(!loader.wait_for_completion(file.0, 50).unwrap());
    assert_eq!(loader.loading_status(file).unwrap(), LoadingStatus::InProgress);
    assert!(matches!(
        loader.objects(file),
        Err(ContentError::NotYetComplete(h)) if h == file.0
    ));
    assert_eq!(store.total_reads(), 0);

    loader.complete_fence(fence).unwrap();
    wait(&loader, file.0);
    assert_eq!(loader.objects(file).unwrap().len(), 2);
}

#[test]
fn dependencies_load_first() {
    let (loader, store) = default_loader();
    store.set_read_delay(Duration::from_millis(20));
    insert_simple_file(&store, "textures.bin");
    store.insert(
        &namespace(),
        "materials.bin",
        graph_bytes(vec![object(
            10,
            vec![ObjectRef::External {
                dependency: 0,
                local_id: LocalId(2),
            }],
        )]),
    );

    let textures = loader
        .load_file_async(&namespace(), "textures.bin", &[], DependencyFence::NONE)
        .unwrap();
    let materials = loader
        .load_file_async(&namespace(), "materials.bin", &[textures], DependencyFence::NONE)
        .unwrap();
    wait(&loader, materials.0);

    // The external reference can only resolve if the dependency completed first
    assert_eq!(loader.loading_status(materials).unwrap(), LoadingStatus::Completed);
    assert_eq!(loader.loading_status(textures).unwrap(), LoadingStatus::Completed);

    let textures_info = loader.load_info(textures.0).unwrap();
    let materials_info = loader.load_info(materials.0).unwrap();
    assert_eq!(materials_info.dependencies, vec![textures.0]);
    assert!(textures_info.load_duration.is_some());
    assert_eq!(materials_info.object_count, Some(1));
}

#[test]
fn dependency_failure_cascades_without_reading() {
    let (loader, store) = default_loader();
    store.set_read_delay(Duration::from_millis(20));
    insert_simple_file(&store, "b.bin");
    insert_simple_file(&store, "c.bin");

    let a = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    let b = loader
        .load_file_async(&namespace(), "b.bin", &[a], DependencyFence::NONE)
        .unwrap();
    let c = loader
        .load_file_async(&namespace(), "c.bin", &[b], DependencyFence::NONE)
        .unwrap();
    wait(&loader, c.0);

    assert_eq!(loader.loading_status(a).unwrap(), LoadingStatus::Failed);
    assert_eq!(loader.loading_status(b).unwrap(), LoadingStatus::Failed);
    assert_eq!(loader.loading_status(c).unwrap(), LoadingStatus::Failed);
    assert!(matches!(
        loader.objects(b),
        Err(ContentError::OperationFailed(LoadFailure::DependencyFailed(h))) if h == a.0
    ));
    assert!(matches!(
        loader.objects(c),
        Err(ContentError::OperationFailed(LoadFailure::DependencyFailed(h))) if h == b.0
    ));
    assert_eq!(store.read_count(&namespace(), "b.bin"), 0);
    assert_eq!(store.read_count(&namespace(), "c.bin"), 0);

    // Depending on an already failed load fails right away as well
    let d = loader
        .load_file_async(&namespace(), "b.bin", &[a], DependencyFence::NONE)
        .unwrap();
    assert_eq!(loader.loading_status(d).unwrap(), LoadingStatus::Failed);
}

#[test]
fn unresolved_reference_fails() {
    let (loader, store) = default_loader();
    store.insert(
        &namespace(),
        "broken.bin",
        graph_bytes(vec![object(
            1,
            vec![ObjectRef::External {
                dependency: 0,
                local_id: LocalId(1),
            }],
        )]),
    );
    store.insert(
        &namespace(),
        "dangling.bin",
        graph_bytes(vec![object(1, vec![ObjectRef::Local(LocalId(5))])]),
    );

    let broken = loader
        .load_file_async(&namespace(), "broken.bin", &[], DependencyFence::NONE)
        .unwrap();
    let dangling = loader
        .load_file_async(&namespace(), "dangling.bin", &[], DependencyFence::NONE)
        .unwrap();
    wait(&loader, broken.0);
    wait(&loader, dangling.0);

    assert!(matches!(
        loader.objects(broken),
        Err(ContentError::OperationFailed(LoadFailure::UnresolvedReference(LocalId(1), _)))
    ));
    assert!(matches!(
        loader.objects(dangling),
        Err(ContentError::OperationFailed(LoadFailure::UnresolvedReference(
            LocalId(1),
            ObjectRef::Local(LocalId(5))
        )))
    ));
}

#[test]
fn invalid_dependency_is_rejected() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");
    let a = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    wait(&loader, a.0);
    loader.unload_async(a).unwrap();

    assert!(matches!(
        loader.load_file_async(&namespace(), "b.bin", &[a], DependencyFence::NONE),
        Err(ContentError::InvalidHandle(h)) if h == a.0
    ));
    assert!(matches!(
        loader.load_file_async(&namespace(), "b.bin", &[ContentFile::INVALID], DependencyFence::NONE),
        Err(ContentError::InvalidHandle(_))
    ));
}

#[test]
fn invalid_handles_fail_cleanly() {
    let (loader, _store) = default_loader();
    assert!(!ContentFile::INVALID.is_valid(&loader));
    assert!(matches!(
        ContentFile::INVALID.loading_status(&loader),
        Err(ContentError::InvalidHandle(_))
    ));
    assert!(matches!(
        ContentSceneFile::INVALID.status(&loader),
        Err(ContentError::InvalidHandle(_))
    ));
    assert!(matches!(
        loader.wait_for_completion(LoadHandle(1234), 10),
        Err(ContentError::InvalidHandle(_))
    ));
    assert!(matches!(
        loader.unload_async(ContentFile(LoadHandle(1234))),
        Err(ContentError::InvalidHandle(_))
    ));
    assert!(matches!(
        loader.integrate_at_end_of_frame(ContentSceneFile::INVALID),
        Err(ContentError::InvalidHandle(_))
    ));
}

#[test]
fn double_unload_is_invalid_handle() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");
    let file = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    wait(&loader, file.0);

    let unload = loader.unload_async(file).unwrap();
    assert!(!loader.is_valid(file.0));
    assert!(unload.wait_for_completion(WAIT_TIMEOUT_MS));
    assert!(loader.registry().is_empty());

    assert!(matches!(
        loader.unload_async(file),
        Err(ContentError::InvalidHandle(h)) if h == file.0
    ));
    assert!(matches!(
        loader.objects(file),
        Err(ContentError::InvalidHandle(_))
    ));

    // Handles are never reused
    let again = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    assert_ne!(again, file);
    assert!(!loader.is_valid(file.0));
}

#[test]
fn unload_waits_for_in_flight_load() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");
    let fence = loader.issue_fence();
    let file = loader
        .load_file_async(&namespace(), "a.bin", &[], fence)
        .unwrap();

    let unload = loader.unload_async(file).unwrap();
    assert!(!loader.is_valid(file.0));
    assert!(!unload.is_completed());
    assert_eq!(loader.registry().len(), 1);

    loader.complete_fence(fence).unwrap();
    assert!(unload.wait_for_completion(WAIT_TIMEOUT_MS));
    assert!(loader.registry().is_empty());
}

#[test]
fn unload_of_a_scene_handle_is_rejected() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "level.bin");
    let scene_file = loader
        .load_scene_async(
            &namespace(),
            "level.bin",
            "level",
            manual_scene(),
            &[],
            DependencyFence::NONE,
        )
        .unwrap();
    assert!(matches!(
        loader.unload_async(ContentFile(scene_file.0)),
        Err(ContentError::InvalidHandle(_))
    ));
    assert!(loader.is_valid(scene_file.0));
}

#[test]
fn scene_handles_cannot_be_dependencies() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "level.bin");
    insert_simple_file(&store, "props.bin");
    let mut host = RecordingSceneHost::default();

    let scene_file = loader
        .load_scene_async(
            &namespace(),
            "level.bin",
            "level",
            manual_scene(),
            &[],
            DependencyFence::NONE,
        )
        .unwrap();
    wait(&loader, scene_file.0);

    assert!(matches!(
        loader.load_file_async(
            &namespace(),
            "props.bin",
            &[ContentFile(scene_file.0)],
            DependencyFence::NONE
        ),
        Err(ContentError::InvalidHandle(h)) if h == scene_file.0
    ));
    assert!(matches!(
        loader.load_scene_async(
            &namespace(),
            "level.bin",
            "other_level",
            manual_scene(),
            &[ContentFile(scene_file.0)],
            DependencyFence::NONE
        ),
        Err(ContentError::InvalidHandle(_))
    ));
    assert_eq!(loader.registry().len(), 1);

    // Unloading the scene before it was ever integrated leaves nothing behind
    scene_file.unload_at_end_of_frame(&loader).unwrap();
    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.unloaded, 1);
    assert!(loader.registry().is_empty());
    assert!(loader.active_loads().is_empty());
}

#[test]
fn identical_loads_are_distinct_by_default() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");
    let first = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    let second = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    assert_ne!(first, second);
    wait(&loader, first.0);
    wait(&loader, second.0);
    assert_eq!(store.read_count(&namespace(), "a.bin"), 2);

    loader.unload_async(first).unwrap();
    assert!(!loader.is_valid(first.0));
    assert!(loader.is_valid(second.0));
}

#[test]
fn identical_loads_share_a_handle_when_enabled() {
    let (loader, store) = create_loader(LoaderConfig {
        share_identical_loads: true,
        ..Default::default()
    });
    insert_simple_file(&store, "a.bin");

    let first = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    let second = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    assert_eq!(first, second);
    wait(&loader, first.0);
    assert_eq!(store.read_count(&namespace(), "a.bin"), 1);
    assert_eq!(loader.load_info(first.0).unwrap().ref_count, 2);

    // The first unload only drops a reference
    let unload = loader.unload_async(first).unwrap();
    assert!(unload.is_completed());
    assert!(loader.is_valid(first.0));
    assert_eq!(loader.objects(first).unwrap().len(), 2);

    let unload = loader.unload_async(second).unwrap();
    assert!(unload.wait_for_completion(WAIT_TIMEOUT_MS));
    assert!(!loader.is_valid(first.0));
    assert!(matches!(
        loader.unload_async(second),
        Err(ContentError::InvalidHandle(_))
    ));

    // Loading it again starts over
    let third = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    assert_ne!(third, first);
    wait(&loader, third.0);
    assert_eq!(store.read_count(&namespace(), "a.bin"), 2);
}

#[test]
fn shared_load_requested_again_after_last_unload() {
    let (loader, store) = create_loader(LoaderConfig {
        share_identical_loads: true,
        ..Default::default()
    });
    insert_simple_file(&store, "a.bin");
    let fence = loader.issue_fence();

    let first = loader
        .load_file_async(&namespace(), "a.bin", &[], fence)
        .unwrap();
    let unload = loader.unload_async(first).unwrap();
    assert!(!loader.is_valid(first.0));
    assert!(!unload.is_completed());

    // The released load is still in flight, so a new request must not pick it up
    let second = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    assert_ne!(first, second);
    wait(&loader, second.0);
    assert_eq!(loader.load_info(second.0).unwrap().ref_count, 1);

    loader.complete_fence(fence).unwrap();
    assert!(unload.wait_for_completion(WAIT_TIMEOUT_MS));
    assert!(!loader.is_valid(first.0));
    assert_eq!(loader.objects(second).unwrap().len(), 2);

    // Tearing down the old load must not make the new one unshareable
    let third = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    assert_eq!(third, second);
    assert_eq!(loader.load_info(second.0).unwrap().ref_count, 2);
}

#[test]
fn shared_loads_with_concurrent_unloads() {
    let (loader, store) = create_loader(LoaderConfig {
        share_identical_loads: true,
        ..Default::default()
    });
    store.set_read_delay(Duration::from_millis(1));
    insert_simple_file(&store, "a.bin");

    let loader = Arc::new(loader);
    let mut join_handles = Vec::default();
    for _ in 0..4 {
        let loader = loader.clone();
        join_handles.push(std::thread::spawn(move || {
            for _ in 0..25 {
                let file = loader
                    .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
                    .unwrap();
                assert!(loader
                    .wait_for_completion(file.0, WAIT_TIMEOUT_MS)
                    .unwrap());
                assert_eq!(loader.objects(file).unwrap().len(), 2);

                let unload = loader.unload_async(file).unwrap();
                assert!(unload.wait_for_completion(WAIT_TIMEOUT_MS));
            }
        }));
    }

    for join_handle in join_handles {
        join_handle.join().unwrap();
    }

    assert!(loader.registry().is_empty());
    assert!(loader.loaded_files(&namespace()).is_empty());
    assert!(store.read_count(&namespace(), "a.bin") <= 100);
}

#[test]
fn shared_loads_retry_after_failure() {
    let (loader, store) = create_loader(LoaderConfig {
        share_identical_loads: true,
        ..Default::default()
    });
    let first = loader
        .load_file_async(&namespace(), "late.bin", &[], DependencyFence::NONE)
        .unwrap();
    wait(&loader, first.0);
    assert_eq!(loader.loading_status(first).unwrap(), LoadingStatus::Failed);

    insert_simple_file(&store, "late.bin");
    let second = loader
        .load_file_async(&namespace(), "late.bin", &[], DependencyFence::NONE)
        .unwrap();
    assert_ne!(first, second);
    wait(&loader, second.0);
    assert_eq!(loader.loading_status(second).unwrap(), LoadingStatus::Completed);
}

#[test]
fn queue_overflow() {
    let (loader, store) = create_loader(LoaderConfig {
        max_queued_requests: 1,
        ..Default::default()
    });
    insert_simple_file(&store, "a.bin");
    insert_simple_file(&store, "b.bin");
    let fence = loader.issue_fence();

    let a = loader
        .load_file_async(&namespace(), "a.bin", &[], fence)
        .unwrap();
    assert_eq!(loader.queued_request_count(), 1);

    let b = loader
        .load_file_async(&namespace(), "b.bin", &[], DependencyFence::NONE)
        .unwrap();
    assert_eq!(loader.loading_status(b).unwrap(), LoadingStatus::Failed);
    assert!(matches!(loader.objects(b), Err(ContentError::QueueOverflow)));
    assert_eq!(store.read_count(&namespace(), "b.bin"), 0);

    loader.complete_fence(fence).unwrap();
    wait(&loader, a.0);
    assert_eq!(loader.loading_status(a).unwrap(), LoadingStatus::Completed);
    assert_eq!(loader.queued_request_count(), 0);

    // Room again
    let c = loader
        .load_file_async(&namespace(), "b.bin", &[], DependencyFence::NONE)
        .unwrap();
    wait(&loader, c.0);
    assert_eq!(loader.loading_status(c).unwrap(), LoadingStatus::Completed);
}

#[test]
fn fences_gate_loads() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");
    insert_simple_file(&store, "b.bin");
    let first = loader.issue_fence();
    let second = loader.issue_fence();
    assert!(!loader.is_fence_satisfied(first));
    assert!(loader.is_fence_satisfied(DependencyFence::NONE));

    let a = loader
        .load_file_async(&namespace(), "a.bin", &[], first)
        .unwrap();
    let b = loader
        .load_file_async(&namespace(), "b.bin", &[], second)
        .unwrap();

    loader.complete_fence(second).unwrap();
    wait(&loader, b.0);
    assert_eq!(loader.loading_status(a).unwrap(), LoadingStatus::InProgress);

    loader.complete_fence(first).unwrap();
    wait(&loader, a.0);
    assert!(loader.is_fence_satisfied(first));

    assert!(matches!(
        loader.complete_fence(first),
        Err(ContentError::ConfigurationError(_))
    ));
    assert!(matches!(
        loader.load_file_async(
            &namespace(),
            "a.bin",
            &[],
            DependencyFence::from_generation(1000)
        ),
        Err(ContentError::ConfigurationError(_))
    ));
}

#[test]
fn global_table_fence() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");
    let file = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::GLOBAL_TABLE)
        .unwrap();
    assert!(!loader.wait_for_completion(file.0, 50).unwrap());

    loader.signal_global_table_ready().unwrap();
    wait(&loader, file.0);
    assert!(matches!(
        loader.signal_global_table_ready(),
        Err(ContentError::ConfigurationError(_))
    ));

    // Satisfied from now on
    let later = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::GLOBAL_TABLE)
        .unwrap();
    wait(&loader, later.0);
}

#[test]
fn single_worker_runs_one_load_at_a_time() {
    let (loader, store) = create_loader(LoaderConfig {
        worker_count: 1,
        ..Default::default()
    });
    store.set_read_delay(Duration::from_millis(50));
    insert_simple_file(&store, "a.bin");
    insert_simple_file(&store, "b.bin");

    let start = Instant::now();
    let a = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    let b = loader
        .load_file_async(&namespace(), "b.bin", &[], DependencyFence::NONE)
        .unwrap();
    wait(&loader, a.0);
    wait(&loader, b.0);
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn loads_from_many_threads() {
    let (loader, store) = default_loader();
    for i in 0..20 {
        insert_simple_file(&store, &format!("file_{}.bin", i));
    }

    let loader = Arc::new(loader);
    let mut join_handles = Vec::default();
    for _ in 0..4 {
        let loader = loader.clone();
        join_handles.push(std::thread::spawn(move || {
            (0..20)
                .map(|i| {
                    loader
                        .load_file_async(
                            &namespace(),
                            &format!("file_{}.bin", i),
                            &[],
                            DependencyFence::NONE,
                        )
                        .unwrap()
                })
                .collect::<Vec<_>>()
        }));
    }

    let mut files: Vec<ContentFile> = join_handles
        .into_iter()
        .flat_map(|x| x.join().unwrap())
        .collect();
    for file in &files {
        wait(&loader, file.0);
        assert_eq!(loader.loading_status(*file).unwrap(), LoadingStatus::Completed);
    }

    files.sort_by_key(|x| x.0);
    files.dedup();
    assert_eq!(files.len(), 80);
    assert_eq!(loader.loaded_files(&namespace()).len(), 80);
}

#[test]
fn auto_integrated_scene() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "level.bin");
    let mut host = RecordingSceneHost::default();

    let scene_file = loader
        .load_scene_async(
            &namespace(),
            "level.bin",
            "level",
            ContentSceneParameters::default(),
            &[],
            DependencyFence::NONE,
        )
        .unwrap();
    assert!(scene_file
        .wait_for_completion(&loader, WAIT_TIMEOUT_MS)
        .unwrap());
    assert_eq!(
        scene_file.status(&loader).unwrap(),
        SceneLoadingStatus::WillIntegrateNextFrame
    );
    assert!(matches!(
        scene_file.scene(&loader),
        Err(ContentError::NotYetComplete(_))
    ));

    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.integrated, 1);
    assert_eq!(stats.carried_over, 0);
    assert_eq!(scene_file.status(&loader).unwrap(), SceneLoadingStatus::Complete);

    let scene = scene_file.scene(&loader).unwrap();
    assert_eq!(host.attached, vec![scene]);
    assert_eq!(host.instantiated, vec!["level".to_string()]);
    assert_eq!(loader.objects(ContentFile(scene_file.0)).unwrap().len(), 2);
}

#[test]
fn manual_scene_waits_for_integrate_request() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "level.bin");
    let mut host = RecordingSceneHost::default();

    let scene_file = loader
        .load_scene_async(
            &namespace(),
            "level.bin",
            "level",
            manual_scene(),
            &[],
            DependencyFence::NONE,
        )
        .unwrap();
    wait(&loader, scene_file.0);

    for _ in 0..3 {
        let stats = loader.run_integration_pass(&mut host);
        assert_eq!(stats.integrated, 0);
        assert_eq!(
            scene_file.status(&loader).unwrap(),
            SceneLoadingStatus::WaitingForIntegrate
        );
    }
    assert!(host.instantiated.is_empty());

    scene_file.integrate_at_end_of_frame(&loader).unwrap();
    assert_eq!(
        scene_file.status(&loader).unwrap(),
        SceneLoadingStatus::WillIntegrateNextFrame
    );
    // Asking twice is harmless
    scene_file.integrate_at_end_of_frame(&loader).unwrap();

    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.integrated, 1);
    assert_eq!(scene_file.status(&loader).unwrap(), SceneLoadingStatus::Complete);
    assert_eq!(host.instantiated.len(), 1);
}

#[test]
fn integrate_request_is_remembered_while_loading() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "level.bin");
    let fence = loader.issue_fence();

    let scene_file = loader
        .load_scene_async(&namespace(), "level.bin", "level", manual_scene(), &[], fence)
        .unwrap();
    scene_file.integrate_at_end_of_frame(&loader).unwrap();
    assert_eq!(scene_file.status(&loader).unwrap(), SceneLoadingStatus::InProgress);

    loader.complete_fence(fence).unwrap();
    wait(&loader, scene_file.0);
    assert_eq!(
        scene_file.status(&loader).unwrap(),
        SceneLoadingStatus::WillIntegrateNextFrame
    );
}

#[test]
fn integration_failure() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "refused.bin");
    let mut unknown_type = object(1, vec![]);
    unknown_type.type_id = ObjectTypeId::null();
    store.insert(&namespace(), "unknown.bin", graph_bytes(vec![unknown_type]));

    let mut host = RecordingSceneHost {
        refuse_to_attach: vec!["refused".to_string()],
        ..Default::default()
    };

    let refused = loader
        .load_scene_async(
            &namespace(),
            "refused.bin",
            "refused",
            ContentSceneParameters::default(),
            &[],
            DependencyFence::NONE,
        )
        .unwrap();
    let unknown = loader
        .load_scene_async(
            &namespace(),
            "unknown.bin",
            "unknown",
            ContentSceneParameters::default(),
            &[],
            DependencyFence::NONE,
        )
        .unwrap();
    wait(&loader, refused.0);
    wait(&loader, unknown.0);

    loader.set_integration_time_ms(1000.0).unwrap();
    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.failed, 2);
    assert_eq!(refused.status(&loader).unwrap(), SceneLoadingStatus::Failed);
    assert_eq!(unknown.status(&loader).unwrap(), SceneLoadingStatus::Failed);
    assert_eq!(host.discarded.len(), 1);
    assert!(host.attached.is_empty());

    assert!(matches!(
        refused.scene(&loader),
        Err(ContentError::OperationFailed(LoadFailure::Integration(_)))
    ));
    assert!(matches!(
        refused.integrate_at_end_of_frame(&loader),
        Err(ContentError::OperationFailed(_))
    ));
}

fn load_manual_scenes(
    loader: &ContentLoader,
    store: &RamContentStore,
    names: &[&str],
) -> Vec<ContentSceneFile> {
    names
        .iter()
        .map(|name| {
            let filename = format!("{}.bin", name);
            insert_simple_file(store, &filename);
            let scene_file = loader
                .load_scene_async(
                    &namespace(),
                    &filename,
                    name,
                    manual_scene(),
                    &[],
                    DependencyFence::NONE,
                )
                .unwrap();
            wait(loader, scene_file.0);
            scene_file
        })
        .collect()
}

#[test]
fn integration_respects_time_budget() {
    let (loader, store) = default_loader();
    let scenes = load_manual_scenes(&loader, &store, &["a", "b", "c"]);
    for scene_file in &scenes {
        scene_file.integrate_at_end_of_frame(&loader).unwrap();
    }

    // Each scene costs more than the whole budget, so one scene per pass
    loader.set_integration_time_ms(1.0).unwrap();
    let mut host = RecordingSceneHost {
        instantiate_delay: Duration::from_millis(5),
        ..Default::default()
    };

    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.integrated, 1);
    assert_eq!(stats.carried_over, 2);
    assert_eq!(scenes[0].status(&loader).unwrap(), SceneLoadingStatus::Complete);
    assert_eq!(
        scenes[1].status(&loader).unwrap(),
        SceneLoadingStatus::WillIntegrateNextFrame
    );

    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.integrated, 1);
    assert_eq!(stats.carried_over, 1);

    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.integrated, 1);
    assert_eq!(stats.carried_over, 0);
    assert_eq!(host.instantiated, vec!["a", "b", "c"]);
}

#[test]
fn generous_budget_integrates_everything() {
    let (loader, store) = default_loader();
    let scenes = load_manual_scenes(&loader, &store, &["a", "b", "c", "d"]);
    for scene_file in &scenes {
        scene_file.integrate_at_end_of_frame(&loader).unwrap();
    }

    loader.set_integration_time_ms(10_000.0).unwrap();
    let mut host = RecordingSceneHost::default();
    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.integrated, 4);
    assert_eq!(stats.carried_over, 0);
}

#[test]
fn integration_order_follows_eligibility() {
    let (loader, store) = default_loader();
    let scenes = load_manual_scenes(&loader, &store, &["a", "b", "c"]);
    scenes[2].integrate_at_end_of_frame(&loader).unwrap();
    scenes[0].integrate_at_end_of_frame(&loader).unwrap();
    scenes[1].integrate_at_end_of_frame(&loader).unwrap();

    loader.set_integration_time_ms(10_000.0).unwrap();
    let mut host = RecordingSceneHost::default();
    loader.run_integration_pass(&mut host);
    assert_eq!(host.instantiated, vec!["c", "a", "b"]);
}

#[test]
fn integration_time_must_be_positive() {
    let (loader, _store) = default_loader();
    assert_eq!(loader.integration_time_ms(), 2.0);
    for invalid in [0.0, -1.0, f32::NAN] {
        assert!(matches!(
            loader.set_integration_time_ms(invalid),
            Err(ContentError::ConfigurationError(_))
        ));
    }
    assert_eq!(loader.integration_time_ms(), 2.0);

    loader.set_integration_time_ms(4.5).unwrap();
    assert_eq!(loader.integration_time_ms(), 4.5);
}

#[test]
fn huge_integration_time_is_rejected() {
    let (loader, store) = default_loader();
    assert!(matches!(
        loader.set_integration_time_ms(1.0e30),
        Err(ContentError::ConfigurationError(_))
    ));
    assert!(matches!(
        loader.set_integration_time_ms(f32::INFINITY),
        Err(ContentError::ConfigurationError(_))
    ));
    assert_eq!(loader.integration_time_ms(), 2.0);

    // The largest accepted budget still runs a pass
    let scenes = load_manual_scenes(&loader, &store, &["a", "b"]);
    for scene_file in &scenes {
        scene_file.integrate_at_end_of_frame(&loader).unwrap();
    }
    loader.set_integration_time_ms(60_000.0).unwrap();
    let mut host = RecordingSceneHost::default();
    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.integrated, 2);
    assert_eq!(stats.carried_over, 0);
}

#[test]
fn unload_scene_at_end_of_frame() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "level.bin");
    let mut host = RecordingSceneHost::default();

    let scene_file = loader
        .load_scene_async(
            &namespace(),
            "level.bin",
            "level",
            ContentSceneParameters::default(),
            &[],
            DependencyFence::NONE,
        )
        .unwrap();
    wait(&loader, scene_file.0);
    loader.run_integration_pass(&mut host);
    let scene = scene_file.scene(&loader).unwrap();

    scene_file.unload_at_end_of_frame(&loader).unwrap();
    assert!(!scene_file.is_valid(&loader));
    assert!(matches!(
        scene_file.unload_at_end_of_frame(&loader),
        Err(ContentError::InvalidHandle(_))
    ));
    // Nothing happens to the live scene graph until the pass
    assert_eq!(host.attached, vec![scene]);

    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.unloaded, 1);
    assert_eq!(host.detached, vec![scene]);
    assert!(host.attached.is_empty());
    assert!(loader.registry().is_empty());
}

#[test]
fn unload_of_loading_scene_is_carried_over() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "level.bin");
    let fence = loader.issue_fence();
    let mut host = RecordingSceneHost::default();

    let scene_file = loader
        .load_scene_async(
            &namespace(),
            "level.bin",
            "level",
            ContentSceneParameters::default(),
            &[],
            fence,
        )
        .unwrap();
    scene_file.unload_at_end_of_frame(&loader).unwrap();

    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.unloaded, 0);
    assert_eq!(loader.integration_gate().pending_unload_count(), 1);

    loader.complete_fence(fence).unwrap();
    let start = Instant::now();
    while loader.load_info(scene_file.0).unwrap().scene_loading_status
        == Some(SceneLoadingStatus::InProgress)
    {
        assert!(start.elapsed() < Duration::from_millis(WAIT_TIMEOUT_MS));
        std::thread::sleep(Duration::from_millis(1));
    }

    let stats = loader.run_integration_pass(&mut host);
    assert_eq!(stats.unloaded, 1);
    assert_eq!(stats.integrated, 0);
    assert!(host.instantiated.is_empty());
    assert!(loader.registry().is_empty());
}

#[test]
fn shutdown_fails_loads_waiting_on_fences() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");
    insert_simple_file(&store, "b.bin");
    insert_simple_file(&store, "level.bin");
    let fence = loader.issue_fence();

    let fenced = loader
        .load_file_async(&namespace(), "a.bin", &[], fence)
        .unwrap();
    let global = loader
        .load_file_async(&namespace(), "b.bin", &[], DependencyFence::GLOBAL_TABLE)
        .unwrap();
    let dependent = loader
        .load_file_async(&namespace(), "b.bin", &[fenced], DependencyFence::NONE)
        .unwrap();
    let scene_file = loader
        .load_scene_async(
            &namespace(),
            "level.bin",
            "level",
            ContentSceneParameters::default(),
            &[],
            fence,
        )
        .unwrap();
    assert_eq!(loader.queued_request_count(), 4);

    loader.shutdown();
    for file in [fenced, global] {
        assert!(loader.wait_for_completion(file.0, 0).unwrap());
        assert!(matches!(
            loader.objects(file),
            Err(ContentError::OperationFailed(LoadFailure::Shutdown))
        ));
    }
    assert_eq!(loader.loading_status(dependent).unwrap(), LoadingStatus::Failed);
    assert!(scene_file.wait_for_completion(&loader, 0).unwrap());
    assert_eq!(scene_file.status(&loader).unwrap(), SceneLoadingStatus::Failed);
    assert_eq!(loader.queued_request_count(), 0);
    assert!(loader.active_loads().is_empty());
    assert_eq!(store.total_reads(), 0);

    // Fences completing afterwards don't bring anything back
    loader.complete_fence(fence).unwrap();
    loader.signal_global_table_ready().unwrap();
    assert_eq!(loader.loading_status(fenced).unwrap(), LoadingStatus::Failed);
    assert_eq!(loader.loading_status(global).unwrap(), LoadingStatus::Failed);
    assert_eq!(store.total_reads(), 0);
}

#[test]
fn shutdown_fails_pending_loads() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");
    let fence = loader.issue_fence();
    let blocked = loader
        .load_file_async(&namespace(), "a.bin", &[], fence)
        .unwrap();
    let dependent = loader
        .load_file_async(&namespace(), "a.bin", &[blocked], DependencyFence::NONE)
        .unwrap();

    loader.shutdown();
    assert!(matches!(
        loader.objects(blocked),
        Err(ContentError::OperationFailed(LoadFailure::Shutdown))
    ));
    assert_eq!(loader.loading_status(dependent).unwrap(), LoadingStatus::Failed);

    let late = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    assert!(matches!(
        loader.objects(late),
        Err(ContentError::OperationFailed(LoadFailure::Shutdown))
    ));

    // Unloading still works without workers
    let unload = loader.unload_async(late).unwrap();
    assert!(unload.is_completed());
}

#[test]
fn diagnostics() {
    let (loader, store) = default_loader();
    insert_simple_file(&store, "a.bin");
    insert_simple_file(&store, "level.bin");
    let other = ContentNamespace::new("other").unwrap();
    let fence = loader.issue_fence();

    let a = loader
        .load_file_async(&namespace(), "a.bin", &[], DependencyFence::NONE)
        .unwrap();
    let blocked = loader
        .load_file_async(&other, "a.bin", &[], fence)
        .unwrap();
    let scene_file = loader
        .load_scene_async(
            &namespace(),
            "level.bin",
            "level",
            manual_scene(),
            &[a],
            DependencyFence::NONE,
        )
        .unwrap();
    wait(&loader, a.0);
    wait(&loader, scene_file.0);

    assert_eq!(loader.active_loads(), vec![blocked.0, scene_file.0]);
    assert_eq!(loader.loaded_files(&namespace()), vec![a]);
    assert_eq!(loader.loaded_files(&other), vec![blocked]);
    assert_eq!(loader.loaded_scenes(&namespace()), vec![scene_file]);
    assert!(loader.loaded_scenes(&other).is_empty());

    let info = loader.load_info(scene_file.0).unwrap();
    assert_eq!(info.scene_name.as_deref(), Some("level"));
    assert_eq!(info.filename, "level.bin");
    assert_eq!(info.loading_status, LoadingStatus::InProgress);
    assert_eq!(
        info.scene_loading_status,
        Some(SceneLoadingStatus::WaitingForIntegrate)
    );
    assert_eq!(info.dependencies, vec![a.0]);
    assert_eq!(info.ref_count, 1);
    assert!(!info.released);

    let info = loader.load_info(blocked.0).unwrap();
    assert_eq!(info.namespace, other);
    assert_eq!(info.fence, fence);
    assert!(info.object_count.is_none());
    assert!(info.load_duration.is_none());
    assert!(loader.load_info(LoadHandle(9999)).is_none());
}

#[test]
fn disk_store_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    let levels = ContentNamespace::new("levels").unwrap();
    std::fs::create_dir_all(root.path().join("levels")).unwrap();
    std::fs::write(
        root.path().join("levels").join("start.bin"),
        graph_bytes(vec![object(1, vec![])]),
    )
    .unwrap();

    let loader = ContentLoader::with_disk_store(LoaderConfig::default(), root.path()).unwrap();
    let file = loader
        .load_file_async(&levels, "start.bin", &[], DependencyFence::NONE)
        .unwrap();
    wait(&loader, file.0);
    assert_eq!(loader.objects(file).unwrap().len(), 1);

    let escape = loader
        .load_file_async(&levels, "../start.bin", &[], DependencyFence::NONE)
        .unwrap();
    wait(&loader, escape.0);
    match loader.objects(escape) {
        Err(ContentError::OperationFailed(LoadFailure::Io(e))) => {
            assert_eq!(e.kind(), std::io::ErrorKind::InvalidInput)
        }
        other => panic!("unexpected result {:?}", other),
    }

    assert!(ContentLoader::with_disk_store(LoaderConfig::default(), root.path().join("nope")).is_err());
}

#[test]
fn invalid_config_is_rejected() {
    let store = Arc::new(RamContentStore::default());
    let result = ContentLoader::new(
        LoaderConfig {
            worker_count: 0,
            ..Default::default()
        },
        Box::new(store),
        Box::new(BincodeDeserializer),
    );
    assert!(matches!(result, Err(ContentError::ConfigurationError(_))));
}
