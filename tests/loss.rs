mod common;

use gliner::gliner::{
    one_hot_labels, span_classification_loss, Collator, Example, EntitySpan, TaskMode,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::{Device, Kind, Tensor};

use common::{build_model, small_config, words};

extern crate anyhow;

#[test]
fn label_round_trip() -> anyhow::Result<()> {
    let num_classes = 6;
    let labels = Tensor::from_slice(&[1i64, 2, 3, 4, 5, 6, 0, -1]);
    let one_hot = one_hot_labels(&labels, num_classes);
    assert_eq!(one_hot.size(), vec![8, num_classes]);

    let row_sums = Vec::<f32>::try_from(one_hot.sum_dim_intlist([1].as_slice(), false, Kind::Float))?;
    assert_eq!(row_sums, vec![1., 1., 1., 1., 1., 1., 0., 0.]);
    let recovered = Vec::<i64>::try_from(one_hot.narrow(0, 0, 6).argmax(1, false) + 1)?;
    assert_eq!(recovered, vec![1, 2, 3, 4, 5, 6]);
    Ok(())
}

#[test]
fn positive_cells_are_weighted_twice() -> anyhow::Result<()> {
    //    All logits at 0: every cell costs ln(2), the positive one counts twice
    let scores = Tensor::zeros([1, 2, 2], (Kind::Float, Device::Cpu));
    let labels = Tensor::from_slice(&[1i64, 0]).view([1, 2]);
    let mask = Tensor::from_slice(&[true, true]).view([1, 2]);
    let loss = f64::try_from(span_classification_loss(&scores, &labels, &mask))?;
    assert!((loss - 5.0 * 2f64.ln()).abs() < 1e-5);
    Ok(())
}

#[test]
fn masked_cells_contribute_zero() -> anyhow::Result<()> {
    tch::manual_seed(3);
    let scores = Tensor::randn([2, 3, 5], (Kind::Float, Device::Cpu));
    let labels = Tensor::from_slice(&[1i64, 0, 3, 2, 5, -1]).view([2, 3]);
    let mask = Tensor::from_slice(&[
        true, true, true, false, false, true, true, true, true, true,
    ])
    .view([2, 5]);
    let loss = f64::try_from(span_classification_loss(&scores, &labels, &mask))?;

    //    Masked type slots of the first example and the padding candidate of the second
    let perturbed = scores.copy();
    let _ = perturbed.narrow(0, 0, 1).narrow(2, 3, 2).fill_(1e4);
    let _ = perturbed.narrow(0, 1, 1).narrow(1, 2, 1).fill_(-1e4);
    let perturbed_loss = f64::try_from(span_classification_loss(&perturbed, &labels, &mask))?;

    assert_eq!(loss, perturbed_loss);
    Ok(())
}

#[test]
fn entity_type_mask_follows_per_example_types() -> anyhow::Result<()> {
    let config = small_config(TaskMode::Ner);
    let (_vs, model) = build_model(&config)?;
    let collator = Collator::new(&config);

    let mut first = Example::new(words("Steve Jobs founded Apple"))
        .with_entities(vec![EntitySpan::new(0, 1, "person")]);
    first.label = Some(vec!["person".into(), "organization".into(), "location".into()]);
    let mut second = Example::new(words("Marie Curie was born in Warsaw"))
        .with_entities(vec![EntitySpan::new(5, 5, "city")]);
    second.label = Some(
        ["a", "b", "c", "d", "city"]
            .iter()
            .map(|label| label.to_string())
            .collect(),
    );

    let mut rng = StdRng::seed_from_u64(0);
    let batch = collator.collate_train(&[first, second], &mut rng)?;
    let output = tch::no_grad(|| model.compute_scores(&batch, false))?;

    let mask = Vec::<bool>::try_from(output.entity_type_mask.view([-1]))?;
    assert_eq!(
        mask,
        vec![true, true, true, false, false, true, true, true, true, true]
    );
    assert_eq!(output.scores.size(), vec![2, 6 * config.max_width, 5]);

    //    Scores of masked slots do not change the loss
    let loss = f64::try_from(span_classification_loss(
        &output.scores,
        &batch.labels,
        &output.entity_type_mask,
    ))?;
    let perturbed = output.scores.copy();
    let _ = perturbed.narrow(0, 0, 1).narrow(2, 3, 2).fill_(50.0);
    let perturbed_loss = f64::try_from(span_classification_loss(
        &perturbed,
        &batch.labels,
        &output.entity_type_mask,
    ))?;
    assert_eq!(loss, perturbed_loss);
    Ok(())
}

#[test]
fn nan_loss_is_returned() -> anyhow::Result<()> {
    let scores = Tensor::from_slice(&[f32::NAN, 0.0]).view([1, 1, 2]);
    let labels = Tensor::from_slice(&[1i64]).view([1, 1]);
    let mask = Tensor::from_slice(&[true, true]).view([1, 2]);
    let loss = f64::try_from(span_classification_loss(&scores, &labels, &mask))?;
    assert!(loss.is_nan());
    Ok(())
}
