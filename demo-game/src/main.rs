use std::sync::Arc;
use std::time::Duration;
use stowage::base::{
    ContentFile, ContentNamespace, ContentObject, ContentSceneParameters, DependencyFence,
    IntegrationError, LocalId, ObjectGraph, ObjectRef, ObjectTypeId, SceneHandle,
    SceneLoadingStatus,
};
use stowage::loader::{
    serialize_object_graph, BincodeDeserializer, ContentLoader, LoaderConfig, RamContentStore,
    SceneHost, SceneInstantiateInfo,
};

const FRAME_COUNT: usize = 40;

fn texture_type() -> ObjectTypeId {
    ObjectTypeId(uuid::Uuid::parse_str("fe9a9f83-a7c1-4a00-b61d-17a1dca43717").unwrap())
}

fn material_type() -> ObjectTypeId {
    ObjectTypeId(uuid::Uuid::parse_str("522aaf98-5dc3-4578-a4cc-411ca6c0a826").unwrap())
}

fn transform_type() -> ObjectTypeId {
    ObjectTypeId(uuid::Uuid::parse_str("798bd93b-e6d1-4f45-9d31-d7e689c28c03").unwrap())
}

fn content_object(
    local_id: u64,
    type_id: ObjectTypeId,
    name: &str,
    references: Vec<ObjectRef>,
) -> ContentObject {
    ContentObject {
        local_id: LocalId(local_id),
        type_id,
        name: name.to_string(),
        payload: vec![0; 64],
        references,
    }
}

// Fills an in-memory store with a texture file, a material file referencing it, and a level
fn populate_store(
    store: &RamContentStore,
    namespace: &ContentNamespace,
) {
    let textures = ObjectGraph::new(vec![
        content_object(1, texture_type(), "brick_albedo", vec![]),
        content_object(2, texture_type(), "brick_normal", vec![]),
    ])
    .unwrap();

    let materials = ObjectGraph::new(vec![content_object(
        1,
        material_type(),
        "brick",
        vec![
            ObjectRef::External {
                dependency: 0,
                local_id: LocalId(1),
            },
            ObjectRef::External {
                dependency: 0,
                local_id: LocalId(2),
            },
        ],
    )])
    .unwrap();

    let level = ObjectGraph::new(
        (1..=8)
            .map(|i| {
                content_object(
                    i,
                    transform_type(),
                    &format!("wall_{}", i),
                    vec![ObjectRef::External {
                        dependency: 0,
                        local_id: LocalId(1),
                    }],
                )
            })
            .collect(),
    )
    .unwrap();

    store.insert(namespace, "textures.bin", serialize_object_graph(&textures).unwrap());
    store.insert(namespace, "materials.bin", serialize_object_graph(&materials).unwrap());
    store.insert(namespace, "level.bin", serialize_object_graph(&level).unwrap());
}

// Stands in for the engine's scene graph
#[derive(Default)]
struct DemoSceneHost {
    next_scene: u64,
    live_scenes: Vec<(SceneHandle, String)>,
}

impl SceneHost for DemoSceneHost {
    fn instantiate(
        &mut self,
        objects: &ObjectGraph,
        info: &SceneInstantiateInfo,
    ) -> Result<SceneHandle, IntegrationError> {
        profiling::scope!("DemoSceneHost::instantiate");
        self.next_scene += 1;
        println!(
            "instantiate scene {} from {}/{} with {} objects ({:?})",
            info.scene_name,
            info.namespace,
            info.filename,
            objects.len(),
            info.parameters.load_scene_mode
        );
        Ok(SceneHandle(self.next_scene))
    }

    fn attach(
        &mut self,
        scene: SceneHandle,
    ) -> Result<(), IntegrationError> {
        self.live_scenes.push((scene, format!("scene_{}", scene.0)));
        println!("attach {:?}, {} live scenes", scene, self.live_scenes.len());
        Ok(())
    }

    fn detach(
        &mut self,
        scene: SceneHandle,
    ) {
        self.live_scenes.retain(|(x, _)| *x != scene);
        println!("detach {:?}, {} live scenes", scene, self.live_scenes.len());
    }
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    let namespace = ContentNamespace::new("demo").unwrap();
    let store = Arc::new(RamContentStore::default());
    store.set_read_delay(Duration::from_millis(30));
    populate_store(&store, &namespace);

    let config = LoaderConfig {
        worker_count: 2,
        integration_time_ms: 1.0,
        ..Default::default()
    };
    let loader = ContentLoader::new(
        config,
        Box::new(store.clone()),
        Box::new(BincodeDeserializer),
    )
    .unwrap();

    let textures = loader
        .load_file_async(&namespace, "textures.bin", &[], DependencyFence::NONE)
        .unwrap();
    let materials = loader
        .load_file_async(&namespace, "materials.bin", &[textures], DependencyFence::NONE)
        .unwrap();

    // The level waits for the game to say it's ready, and for the materials it references
    let level_fence = loader.issue_fence();
    let level = loader
        .load_scene_async(
            &namespace,
            "level.bin",
            "level",
            ContentSceneParameters {
                auto_integrate: false,
                ..Default::default()
            },
            &[materials],
            level_fence,
        )
        .unwrap();

    let mut host = DemoSceneHost::default();
    for frame in 0..FRAME_COUNT {
        profiling::scope!("frame");
        std::thread::sleep(Duration::from_millis(15));

        if frame == 2 {
            println!("completing level fence");
            loader.complete_fence(level_fence).unwrap();
        }

        if level.status(&loader).ok() == Some(SceneLoadingStatus::WaitingForIntegrate) {
            level.integrate_at_end_of_frame(&loader).unwrap();
        }

        if frame == FRAME_COUNT / 2 && level.is_valid(&loader) {
            level.unload_at_end_of_frame(&loader).unwrap();
        }

        let stats = loader.run_integration_pass(&mut host);
        println!(
            "frame {}: active loads {:?}, materials {:?}, level {:?}, pass {:?}",
            frame,
            loader.active_loads(),
            materials.loading_status(&loader),
            level.status(&loader),
            stats
        );

        if let Ok(objects) = materials.objects(&loader) {
            for object in objects.objects() {
                println!("  material {} references {:?}", object.name, object.references);
            }
        }

        profiling::finish_frame!();
    }

    for file in [materials, textures] {
        let unload = loader.unload_async(file).unwrap();
        unload.wait_for_completion(1000);
    }

    let remaining: Vec<ContentFile> = loader.loaded_files(&namespace);
    println!(
        "remaining files {:?}, total reads {}",
        remaining,
        store.total_reads()
    );
    loader.shutdown();
}
