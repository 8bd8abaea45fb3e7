mod common;

use candle_core::DType;
use cogvideo::nodes::gguf::GgufInputs;
use cogvideo::nodes::model::ModelInputs;
use cogvideo::nodes::{GgufModelLoader, ModelLoader};
use cogvideo::tora::TORA_NUM_LAYERS;
use cogvideo::transformer::ArchFamily;
use cogvideo::transform::{CompileMode, Fp8Mode};
use cogvideo::{DeviceTier, LoaderError, NodeRegistry, PipelineKind};
use serde_json::json;

use common::{context, context_with_version, save, tensor, write_model, write_vae_file, FakeHub};

#[test]
fn test_standard_load_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::new(|request| write_model(&request.local_dir, 2));
    let ctx = context(dir.path(), hub.clone());
    let registry = NodeRegistry::new();

    let outputs = registry
        .invoke(
            "DownloadAndLoadCogVideoModel",
            &ctx,
            &json!({"model": "THUDM/CogVideoX-2b", "precision": "fp16"}),
        )
        .unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].type_tag(), "COGVIDEOPIPE");
    let handle = outputs.into_iter().next().unwrap().into_pipeline().unwrap();

    assert_eq!(hub.calls(), 1);
    let request = hub.request(0);
    assert_eq!(request.repo_id, "THUDM/CogVideoX-2b");
    assert_eq!(request.local_dir, dir.path().join("CogVideo/CogVideo2B"));
    assert_eq!(request.ignore_patterns, vec!["*text_encoder*", "*tokenizer*"]);

    assert_eq!(handle.dtype(), DType::F16);
    assert_eq!(handle.base_path(), dir.path().join("CogVideo/CogVideo2B"));
    assert!(!handle.onediff());
    assert!(!handle.cpu_offloading());
    assert_eq!(handle.model_name(), "THUDM/CogVideoX-2b");
    assert_eq!(handle.scheduler_config()["snr_shift_scale"], 3.0);
    assert_eq!(handle.scheduler_config()["timestep_spacing"], "trailing");

    let pipe = handle.pipe();
    assert_eq!(pipe.kind(), PipelineKind::Standard);
    assert!(pipe.input_with_padding());
    assert!(pipe.patch().is_none());
    assert!(pipe.compilation().is_none());
    assert_eq!(pipe.transformer().num_blocks(), 2);
    for (name, weight) in pipe.transformer().weights().iter() {
        assert_eq!(weight.dtype(), Some(DType::F16), "{}", name);
    }
    assert_eq!(pipe.vae().dtype(), DType::F16);
    assert_eq!(pipe.vae().family(), ArchFamily::Standard);
    assert_eq!(pipe.scheduler().config().num_train_timesteps, 1000);

    // cloning shares the pipeline
    let clone = handle.clone();
    assert!(std::ptr::eq(clone.pipe(), handle.pipe()));
}

#[test]
fn test_present_model_is_not_fetched() {
    let dir = tempfile::tempdir().unwrap();
    write_model(&dir.path().join("CogVideo/CogVideoX-5b"), 2);
    let hub = FakeHub::empty();
    let ctx = context(dir.path(), hub.clone());

    ModelLoader
        .load(&ctx, ModelInputs::new("THUDM/CogVideoX-5b"))
        .unwrap();
    ModelLoader
        .load(&ctx, ModelInputs::new("THUDM/CogVideoX-5b"))
        .unwrap();
    assert_eq!(hub.calls(), 0);
}

#[test]
fn test_missing_transformer_triggers_download() {
    let dir = tempfile::tempdir().unwrap();
    // base folder exists but holds no transformer
    std::fs::create_dir_all(dir.path().join("CogVideo/CogVideoX-5b/vae")).unwrap();
    let hub = FakeHub::new(|request| write_model(&request.local_dir, 2));
    let ctx = context(dir.path(), hub.clone());

    ModelLoader
        .load(&ctx, ModelInputs::new("THUDM/CogVideoX-5b"))
        .unwrap();
    assert_eq!(hub.calls(), 1);
}

#[test]
fn test_old_backend_aborts_before_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::new(|request| write_model(&request.local_dir, 2));
    let ctx = context_with_version(dir.path(), hub.clone(), "0.30.3");

    let err = ModelLoader
        .load(&ctx, ModelInputs::new("THUDM/CogVideoX-5b"))
        .unwrap_err();
    assert!(matches!(err, LoaderError::IncompatibleBackend { .. }));
    assert!(err.to_string().contains("0.31.0"));
    assert_eq!(hub.calls(), 0);
}

#[test]
fn test_img2vid_disables_padding() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::new(|request| write_model(&request.local_dir, 2));
    let ctx = context(dir.path(), hub);

    let handle = ModelLoader
        .load(&ctx, ModelInputs::new("NimVideo/cogvideox-2b-img2vid"))
        .unwrap();
    assert!(!handle.pipe().input_with_padding());
    assert_eq!(
        handle.base_path(),
        dir.path().join("CogVideo/cogvideox-2b-img2vid")
    );
}

#[test]
fn test_fun_pose_uses_control_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::new(|request| write_model(&request.local_dir, 2));
    let ctx = context(dir.path(), hub);

    let handle = ModelLoader
        .load(&ctx, ModelInputs::new("alibaba-pai/CogVideoX-Fun-V1.1-2b-Pose"))
        .unwrap();
    let pipe = handle.pipe();
    assert_eq!(pipe.kind(), PipelineKind::FunControl);
    assert_eq!(pipe.transformer().arch().family(), ArchFamily::Fun);
    assert_eq!(pipe.vae().family(), ArchFamily::Fun);
}

#[test]
fn test_fun_pruned_downloads_into_cogvideo_dir() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::new(|request| {
        write_model(&request.local_dir.join("CogVideoX-Fun-5b-InP"), 2)
    });
    let ctx = context(dir.path(), hub.clone());

    let handle = ModelLoader
        .load(&ctx, ModelInputs::new("kijai/CogVideoX-Fun-5b"))
        .unwrap();
    assert_eq!(hub.request(0).repo_id, "kijai/CogVideoX-Fun-pruned");
    assert_eq!(hub.request(0).local_dir, dir.path().join("CogVideo"));
    assert_eq!(handle.pipe().kind(), PipelineKind::FunInpaint);
    assert_eq!(
        handle.base_path(),
        dir.path().join("CogVideo/CogVideoX-Fun-5b-InP")
    );
}

#[test]
fn test_transform_options() {
    let dir = tempfile::tempdir().unwrap();
    write_model(&dir.path().join("CogVideo/CogVideoX-5b"), 3);
    let ctx = context(dir.path(), FakeHub::empty());

    let mut inputs = ModelInputs::new("THUDM/CogVideoX-5b");
    inputs.fp8_transformer = Fp8Mode::Enabled;
    inputs.block_edit = Some(vec![2]);
    inputs.compile = CompileMode::Torch;
    inputs.enable_sequential_cpu_offload = true;
    let handle = ModelLoader.load(&ctx, inputs).unwrap();

    let transformer = handle.pipe().transformer();
    assert_eq!(transformer.num_blocks(), 2);
    assert!(transformer
        .weights()
        .get("transformer_blocks.0.attn1.to_q.weight")
        .unwrap()
        .is_fp8());
    assert!(!transformer
        .weights()
        .get("patch_embed.proj.weight")
        .unwrap()
        .is_fp8());
    assert_eq!(transformer.compilation().unwrap().blocks, vec![0, 1]);
    assert!(handle.cpu_offloading());
    assert!(!handle.onediff());
}

#[test]
fn test_onediff_plan_respects_patch() {
    let dir = tempfile::tempdir().unwrap();
    write_model(&dir.path().join("CogVideo/CogVideoX-5b"), 2);
    let ctx = context(dir.path(), FakeHub::empty());
    let registry = NodeRegistry::new();

    let plain = registry
        .invoke(
            "DownloadAndLoadCogVideoModel",
            &ctx,
            &json!({"model": "THUDM/CogVideoX-5b", "compile": "onediff"}),
        )
        .unwrap()
        .remove(0)
        .into_pipeline()
        .unwrap();
    assert!(plain.onediff());
    let plan = plain.pipe().compilation().unwrap();
    assert!(plan.fuse_qkv_projections);
    assert_eq!(plan.backend, "nexfort");

    let patched = registry
        .invoke(
            "DownloadAndLoadCogVideoModel",
            &ctx,
            &json!({
                "model": "THUDM/CogVideoX-5b",
                "compile": "onediff",
                "pab_config": {"spatial": {"broadcast": true, "threshold": [100, 800], "range": 3}}
            }),
        )
        .unwrap()
        .remove(0)
        .into_pipeline()
        .unwrap();
    assert!(patched.pipe().patch().is_some());
    assert!(!patched.pipe().compilation().unwrap().fuse_qkv_projections);
}

#[test]
fn test_out_of_range_block_edit_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_model(&dir.path().join("CogVideo/CogVideoX-5b"), 2);
    let ctx = context(dir.path(), FakeHub::empty());

    let mut inputs = ModelInputs::new("THUDM/CogVideoX-5b");
    inputs.block_edit = Some(vec![5]);
    let err = ModelLoader.load(&ctx, inputs).unwrap_err();
    assert!(matches!(
        err,
        LoaderError::BlockIndexOutOfRange { index: 5, num_blocks: 2 }
    ));
}

#[test]
fn test_gguf_load_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let file = "CogVideoX_5b_I2V_GGUF_Q4_0.safetensors";
    save(
        &dir.path().join("diffusion_models").join(file),
        vec![
            ("patch_embed.proj.weight", tensor(&[8, 32])),
            ("transformer_blocks.0.attn1.to_q.weight", tensor(&[8, 8])),
            ("transformer_blocks.1.attn1.to_q.weight", tensor(&[8, 8])),
        ],
    );
    let hub = FakeHub::new(|request| {
        write_vae_file(&request.local_dir.join("cogvideox_vae.safetensors"))
    });
    let ctx = context(dir.path(), hub.clone());
    let registry = NodeRegistry::new();

    let handle = registry
        .invoke(
            "DownloadAndLoadCogVideoGGUFModel",
            &ctx,
            &json!({
                "model": file,
                "vae_precision": "fp16",
                "fp8_fastmode": true,
                "load_device": "offload_device",
                "enable_sequential_cpu_offload": false,
                "block_edit": [41]
            }),
        )
        .unwrap()
        .remove(0)
        .into_pipeline()
        .unwrap();

    // only the shared VAE was missing
    assert_eq!(hub.calls(), 1);
    assert_eq!(hub.request(0).repo_id, "Kijai/CogVideoX-Fun-pruned");
    assert_eq!(hub.request(0).local_dir, dir.path().join("CogVideo/VAE"));

    assert_eq!(handle.dtype(), DType::F16);
    assert_eq!(handle.base_path(), std::path::Path::new(file));
    assert!(!handle.onediff());
    assert_eq!(handle.model_name(), file);

    let transformer = handle.pipe().transformer();
    assert_eq!(transformer.config().in_channels, 32);
    assert_eq!(transformer.num_blocks(), 41);
    assert!(transformer.weights().iter().all(|(_, w)| w.is_fp8()));
    let compute = transformer.fp8_compute().unwrap();
    assert_eq!(compute.dtype, DType::F16);
    assert!(compute.fast);
    assert_eq!(handle.pipe().vae().dtype(), DType::F16);
    assert_eq!(handle.pipe().kind(), PipelineKind::Standard);
}

#[test]
fn test_gguf_2b_keeps_positional_embedding() {
    let dir = tempfile::tempdir().unwrap();
    let file = "CogVideoX_2b_fun_GGUF_Q4_0.safetensors";
    save(
        &dir.path().join("CogVideo/GGUF").join(file),
        vec![
            ("pos_embedding", tensor(&[4, 8])),
            ("transformer_blocks.0.attn1.to_q.weight", tensor(&[8, 8])),
        ],
    );
    write_vae_file(&dir.path().join("CogVideo/VAE/cogvideox_vae.safetensors"));
    let hub = FakeHub::empty();
    let ctx = context(dir.path(), hub.clone());

    let mut inputs = GgufInputs::new(file);
    inputs.load_device = DeviceTier::Main;
    let handle = GgufModelLoader.load(&ctx, inputs).unwrap();
    assert_eq!(hub.calls(), 0);

    let weights = handle.pipe().transformer().weights();
    assert_eq!(weights.get("pos_embedding").unwrap().dtype(), Some(DType::F16));
    assert!(weights
        .get("transformer_blocks.0.attn1.to_q.weight")
        .unwrap()
        .is_fp8());
    assert_eq!(handle.pipe().transformer().config().in_channels, 33);
    assert_eq!(handle.pipe().kind(), PipelineKind::FunInpaint);
    assert_eq!(handle.dtype(), DType::BF16);
}

#[test]
fn test_gguf_rejects_whole_pipeline_compile() {
    let registry = NodeRegistry::new();
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), FakeHub::empty());
    let err = registry
        .invoke(
            "DownloadAndLoadCogVideoGGUFModel",
            &ctx,
            &json!({"model": "CogVideoX_5b_GGUF_Q4_0.safetensors", "compile": "onediff"}),
        )
        .unwrap_err();
    assert!(matches!(err, LoaderError::InvalidInput { ref field, .. } if field == "compile"));
}

#[test]
fn test_tora_load() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::new(|request| {
        if request.matches("fuser/fuser.safetensors") {
            let names: Vec<String> = (0..TORA_NUM_LAYERS)
                .map(|i| format!("{}.conv.weight", i))
                .collect();
            save(
                &request.local_dir.join("fuser/fuser.safetensors"),
                names.iter().map(|n| (n.as_str(), tensor(&[4]))).collect(),
            );
        }
        if request.matches("traj_extractor/traj_extractor.safetensors") {
            save(
                &request.local_dir.join("traj_extractor/traj_extractor.safetensors"),
                vec![("body.0.weight", tensor(&[4, 4]).to_dtype(DType::F16).unwrap())],
            );
        }
    });
    let ctx = context(dir.path(), hub.clone());
    let registry = NodeRegistry::new();

    let tora = registry
        .invoke(
            "DownloadAndLoadToraModel",
            &ctx,
            &json!({"model": "kijai/CogVideoX-5b-Tora"}),
        )
        .unwrap()
        .remove(0)
        .into_tora()
        .unwrap();

    assert_eq!(hub.calls(), 2);
    assert_eq!(tora.fuser_list.len(), TORA_NUM_LAYERS);
    for (i, fuser) in tora.fuser_list.iter().enumerate() {
        assert_eq!(fuser.layer, i);
        assert_eq!(
            fuser.weights.get("conv.weight").unwrap().dtype(),
            Some(DType::F16)
        );
    }
    assert_eq!(
        tora.traj_extractor.weights.get("body.0.weight").unwrap().dtype(),
        Some(DType::F32)
    );
    assert_eq!(tora.traj_extractor.config.channels, vec![128; 42]);

    // a second load finds both files
    registry
        .invoke(
            "DownloadAndLoadToraModel",
            &ctx,
            &json!({"model": "kijai/CogVideoX-5b-Tora"}),
        )
        .unwrap();
    assert_eq!(hub.calls(), 2);
}

#[test]
fn test_tora_rejects_truncated_fuser() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::new(|request| {
        if request.matches("fuser/fuser.safetensors") {
            let names: Vec<String> = (0..TORA_NUM_LAYERS - 1)
                .map(|i| format!("{}.conv.weight", i))
                .collect();
            save(
                &request.local_dir.join("fuser/fuser.safetensors"),
                names.iter().map(|n| (n.as_str(), tensor(&[4]))).collect(),
            );
        }
    });
    let ctx = context(dir.path(), hub.clone());

    let err = NodeRegistry::new()
        .invoke(
            "DownloadAndLoadToraModel",
            &ctx,
            &json!({"model": "kijai/CogVideoX-5b-Tora"}),
        )
        .unwrap_err();
    assert!(matches!(err, LoaderError::InvalidTora(ref msg) if msg.contains("layer 41")));
    assert_eq!(hub.calls(), 2);
}

#[test]
fn test_controlnet_load() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::new(|request| {
        std::fs::create_dir_all(&request.local_dir).unwrap();
        std::fs::write(
            request.local_dir.join("config.json"),
            r#"{"_class_name": "CogVideoXControlnet", "in_channels": 3, "num_layers": 8, "downscale_coef": 8, "out_proj_dim": 1920}"#,
        )
        .unwrap();
        save(
            &request.local_dir.join("diffusion_pytorch_model.safetensors"),
            vec![("controlnet_encode_first.0.weight", tensor(&[4, 3]))],
        );
    });
    let ctx = context(dir.path(), hub.clone());
    let registry = NodeRegistry::new();

    let model = registry
        .invoke(
            "DownloadAndLoadCogVideoControlNet",
            &ctx,
            &json!({"model": "TheDenk/cogvideox-5b-controlnet-canny-v1"}),
        )
        .unwrap()
        .remove(0)
        .into_controlnet()
        .unwrap();

    assert_eq!(hub.calls(), 1);
    assert_eq!(
        hub.request(0).local_dir,
        dir.path().join("CogVideo/ControlNet/cogvideox-5b-controlnet-canny-v1")
    );
    assert_eq!(model.name, "TheDenk/cogvideox-5b-controlnet-canny-v1");
    assert_eq!(model.config.num_layers, Some(8));
    assert_eq!(model.config.extra["_class_name"], "CogVideoXControlnet");
    assert_eq!(model.weights.len(), 1);
}

#[test]
fn test_schema_rejects_unknown_choice_before_loading() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::empty();
    let ctx = context(dir.path(), hub.clone());
    let err = NodeRegistry::new()
        .invoke(
            "DownloadAndLoadCogVideoModel",
            &ctx,
            &json!({"model": "THUDM/CogVideoX-5b", "fp8_transformer": "int8"}),
        )
        .unwrap_err();
    assert!(matches!(err, LoaderError::InvalidInput { ref field, .. } if field == "fp8_transformer"));
    assert_eq!(hub.calls(), 0);
}
