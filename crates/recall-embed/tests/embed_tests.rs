use recall_core::config::EmbedConfig;
use recall_embed::get_default_embedder;

#[tokio::test]
async fn default_embedder_shapes_and_determinism() {
    let config = EmbedConfig { provider: "hash".into(), dim: 384 };
    let embedder = get_default_embedder(&config).expect("embedder");
    assert_eq!(embedder.embedder_id(), "hash:d384");

    let texts = vec!["hello world".to_string(), "hello world".to_string()];
    let embs = embedder.embed_batch(&texts).await.expect("embed_batch");
    let v1 = &embs[0];
    let v2 = &embs[1];

    assert_eq!(v1.len(), 384, "embedding dim follows config");

    let norm: f32 = v1.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() <= 1e-3, "vector is L2-normalized (norm={norm})");

    for (a, b) in v1.iter().zip(v2.iter()) {
        assert!((a - b).abs() <= 1e-6);
    }
}

#[test]
fn unknown_provider_is_configuration_error() {
    std::env::remove_var("APP_USE_FAKE_EMBEDDINGS");
    let config = EmbedConfig { provider: "bge-m3".into(), dim: 1024 };
    assert!(get_default_embedder(&config).is_err());
}
