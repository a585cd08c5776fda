use std::path::Path;

use gliner::gliner::{
    EncoderType, GlinerConfig, SubTokenPooling, TokenRepresentation, TransformerTokenRep,
    TransformerTokenRepConfig,
};
use gliner::pipelines::gliner::GlinerBuilder;
use gliner::GlinerError;
use tch::{nn, Device, Kind, Tensor};

extern crate anyhow;

const VOCAB: [&str; 15] = [
    "[PAD]",
    "[UNK]",
    "[CLS]",
    "[SEP]",
    "[MASK]",
    "steve",
    "jobs",
    "founded",
    "apple",
    "in",
    "cupertino",
    "california",
    "cat",
    "##s",
    "the",
];
const SPECIAL_TOKENS: [&str; 2] = ["<<ENT>>", "<<SEP>>"];
const HIDDEN_SIZE: i64 = 8;

/// Writes a one-layer BERT configuration and its vocabulary.
fn write_backbone(dir: &Path, max_position_embeddings: i64) -> anyhow::Result<()> {
    let config = serde_json::json!({
        "hidden_act": "gelu",
        "attention_probs_dropout_prob": 0.1,
        "hidden_dropout_prob": 0.1,
        "hidden_size": HIDDEN_SIZE,
        "initializer_range": 0.02,
        "intermediate_size": 16,
        "max_position_embeddings": max_position_embeddings,
        "num_attention_heads": 2,
        "num_hidden_layers": 1,
        "type_vocab_size": 2,
        "vocab_size": VOCAB.len()
    });
    std::fs::write(dir.join("config.json"), config.to_string())?;
    std::fs::write(dir.join("vocab.txt"), VOCAB.join("\n"))?;
    Ok(())
}

fn token_rep(
    dir: &Path,
    pooling: SubTokenPooling,
    hidden_size: i64,
) -> anyhow::Result<(nn::VarStore, TransformerTokenRep)> {
    tch::manual_seed(0);
    let vs = nn::VarStore::new(Device::Cpu);
    let token_rep = TransformerTokenRep::new(
        vs.root() / "token_rep_layer",
        TransformerTokenRepConfig {
            encoder_type: EncoderType::Bert,
            encoder_config: dir.join("config.json"),
            vocab: dir.join("vocab.txt"),
            lower_case: true,
            hidden_size,
            pooling,
            fine_tune: true,
            vocab_size: None,
        },
        &SPECIAL_TOKENS,
    )?;
    Ok((vs, token_rep))
}

fn words(text: &str) -> Vec<String> {
    text.split_whitespace().map(String::from).collect()
}

#[test]
fn reserved_tokens_grow_the_embedding_table() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_backbone(dir.path(), 32)?;
    let (vs, mut token_rep) = token_rep(dir.path(), SubTokenPooling::First, HIDDEN_SIZE)?;

    assert!(token_rep.vocab_size() >= VOCAB.len() as i64 + 2);
    let word_embeddings =
        &vs.variables()["token_rep_layer.bert_layer.model.embeddings.word_embeddings.weight"];
    assert_eq!(
        word_embeddings.size(),
        vec![token_rep.vocab_size(), HIDDEN_SIZE]
    );

    //    Already registered tokens are accepted again, new ones have no embedding row
    token_rep.add_special_tokens(&SPECIAL_TOKENS)?;
    assert!(matches!(
        token_rep.add_special_tokens(&["<<REL>>"]),
        Err(GlinerError::InvalidConfigurationError(_))
    ));

    //    Reserved tokens are single sub-tokens, never split by the word piece model
    let prompted = vec![words("<<ENT>> cat <<SEP>> steve jobs")];
    let output = token_rep.encode(&prompted, &[5], false)?;
    assert_eq!(output.embeddings.size(), vec![1, 5, HIDDEN_SIZE]);
    assert_eq!(Vec::<bool>::try_from(output.mask.view([-1]))?, vec![true; 5]);
    Ok(())
}

#[test]
fn words_beyond_the_encoder_capacity_are_masked() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    //    8 positions: [CLS], 5 single piece words and [SEP] with one position to spare
    write_backbone(dir.path(), 8)?;
    let (_vs, token_rep) = token_rep(dir.path(), SubTokenPooling::First, HIDDEN_SIZE)?;

    let batch = vec![
        words("steve jobs founded apple in cupertino california the cat in"),
        words("the cat"),
    ];
    let output = token_rep.encode(&batch, &[10, 2], false)?;
    assert_eq!(output.embeddings.size(), vec![2, 10, HIDDEN_SIZE]);

    let mask = Vec::<bool>::try_from(output.mask.view([-1]))?;
    let mut expected = vec![false; 20];
    expected[..5].fill(true);
    expected[10..12].fill(true);
    assert_eq!(mask, expected);

    //    Masked words receive no sub-token state
    let masked = output.embeddings.get(0).narrow(0, 5, 5).abs().sum(Kind::Float);
    assert_eq!(f64::try_from(masked)?, 0.0);
    let kept = output.embeddings.get(0).narrow(0, 0, 5).abs().sum(Kind::Float);
    assert!(f64::try_from(kept)? > 0.0);
    Ok(())
}

#[test]
fn sub_token_pooling_strategies() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_backbone(dir.path(), 32)?;
    //    "cats" is split into "cat" and "##s", "the" is a single piece
    let batch = vec![words("cats the")];

    let mut outputs = Vec::new();
    for pooling in [
        SubTokenPooling::First,
        SubTokenPooling::Last,
        SubTokenPooling::Mean,
    ] {
        let (_vs, token_rep) = token_rep(dir.path(), pooling, HIDDEN_SIZE)?;
        outputs.push(token_rep.encode(&batch, &[2], false)?.embeddings);
    }
    let (first, last, mean) = (&outputs[0], &outputs[1], &outputs[2]);

    let split_word = |embeddings: &Tensor| embeddings.get(0).get(0);
    let single_word = |embeddings: &Tensor| embeddings.get(0).get(1);
    assert!(!split_word(first).allclose(&split_word(last), 1e-5, 1e-6, false));
    let halfway = (split_word(first) + split_word(last)) / 2.0;
    assert!(split_word(mean).allclose(&halfway, 1e-5, 1e-6, false));

    assert!(single_word(first).allclose(&single_word(last), 1e-5, 1e-6, false));
    assert!(single_word(first).allclose(&single_word(mean), 1e-5, 1e-6, false));
    Ok(())
}

#[test]
fn differing_hidden_size_adds_a_projection() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_backbone(dir.path(), 32)?;
    let (vs, token_rep) = token_rep(dir.path(), SubTokenPooling::First, 6)?;

    assert!(vs
        .variables()
        .contains_key("token_rep_layer.projection.weight"));
    let output = token_rep.encode(&[words("steve jobs")], &[2], false)?;
    assert_eq!(output.embeddings.size(), vec![1, 2, 6]);

    let (vs, _) = token_rep(dir.path(), SubTokenPooling::First, HIDDEN_SIZE)?;
    assert!(!vs
        .variables()
        .contains_key("token_rep_layer.projection.weight"));
    Ok(())
}

fn bert_gliner_config() -> GlinerConfig {
    GlinerConfig {
        encoder_type: EncoderType::Bert,
        hidden_size: HIDDEN_SIZE,
        max_width: 4,
        dropout: 0.1,
        lower_case: true,
        ..Default::default()
    }
}

#[test]
fn backbone_without_weights_requires_random_init() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_backbone(dir.path(), 32)?;

    match GlinerBuilder::backbone(bert_gliner_config(), dir.path())
        .with_device(Device::Cpu)
        .create_model()
    {
        Err(GlinerError::CheckpointNotFound(path)) => assert_eq!(path, dir.path()),
        Err(error) => panic!("unexpected error: {error}"),
        Ok(_) => panic!("a backbone without weights was silently initialized"),
    }

    let model = GlinerBuilder::backbone(bert_gliner_config(), dir.path())
        .with_device(Device::Cpu)
        .with_random_init(true)
        .create_model()?;
    let entities = model.predict_entities("Steve Jobs founded Apple", &["person"], true, 0.0)?;
    assert!(!entities.is_empty());
    Ok(())
}

#[test]
fn backbone_weights_fill_the_original_vocabulary_rows() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_backbone(dir.path(), 32)?;
    Tensor::save_multi(
        &[(
            "bert.embeddings.word_embeddings.weight",
            Tensor::ones([VOCAB.len() as i64, HIDDEN_SIZE], (Kind::Float, Device::Cpu)),
        )],
        dir.path().join("rust_model.ot"),
    )?;

    let model = GlinerBuilder::backbone(bert_gliner_config(), dir.path())
        .with_device(Device::Cpu)
        .create_model()?;
    let word_embeddings = model.var_store().variables()
        ["token_rep_layer.bert_layer.model.embeddings.word_embeddings.weight"]
        .copy();
    let rows = word_embeddings.size()[0];
    assert!(rows >= VOCAB.len() as i64 + 2);

    let copied = word_embeddings.narrow(0, 0, VOCAB.len() as i64);
    assert!(copied.allclose(&copied.ones_like(), 1e-6, 1e-6, false));
    let reserved = word_embeddings.narrow(0, VOCAB.len() as i64, rows - VOCAB.len() as i64);
    assert!(!reserved.allclose(&reserved.ones_like(), 1e-6, 1e-6, false));
    assert_eq!(
        model.config().encoder_vocab_size,
        Some(rows)
    );
    Ok(())
}
