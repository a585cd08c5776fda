mod common;

use gliner::gliner::{Collator, EntitySpan, Example, SpanMode, TaskMode};
use tch::Kind;

use common::{build_model, build_model_with_budget, small_config, words};

extern crate anyhow;

#[test]
fn ner_scores_cover_every_span() -> anyhow::Result<()> {
    let config = small_config(TaskMode::Ner);
    let (_vs, model) = build_model(&config)?;
    let collator = Collator::new(&config);

    let examples = vec![
        Example::new(words("Apple Inc. was founded by Steve Jobs ."))
            .with_entities(vec![
                EntitySpan::new(0, 1, "organization"),
                EntitySpan::new(5, 6, "person"),
            ]),
        Example::new(words("Paris is in France")).with_entities(vec![
            EntitySpan::new(0, 0, "location"),
            EntitySpan::new(3, 3, "location"),
        ]),
    ];
    let batch = collator.collate_with_types(&examples, &["person", "organization", "location"])?;
    let output = tch::no_grad(|| model.compute_scores(&batch, false))?;

    assert_eq!(output.scores.size(), vec![2, 8 * config.max_width, 3]);
    assert_eq!(output.entity_type_mask.size(), vec![2, 3]);
    assert_eq!(output.scores.kind(), Kind::Float);

    let loss = f64::try_from(model.forward_loss(&batch, false)?)?;
    assert!(loss.is_finite());
    assert!(loss > 0.0);
    Ok(())
}

#[test]
fn scores_do_not_depend_on_dropout_in_eval_mode() -> anyhow::Result<()> {
    let config = small_config(TaskMode::Ner);
    let (_vs, model) = build_model(&config)?;
    let collator = Collator::new(&config);

    let examples = vec![Example::new(words("Marie Curie was born in Warsaw"))];
    let batch = collator.collate_with_types(&examples, &["person", "city"])?;
    let first = tch::no_grad(|| model.compute_scores(&batch, false))?;
    let second = tch::no_grad(|| model.compute_scores(&batch, false))?;
    assert!(first.scores.allclose(&second.scores, 1e-6, 1e-6, false));
    Ok(())
}

#[test]
fn relation_scores_cover_every_entity_pair() -> anyhow::Result<()> {
    for span_mode in [SpanMode::MarkerV0, SpanMode::MarkerContext] {
        let mut config = small_config(TaskMode::Relation);
        config.span_mode = span_mode;
        let (_vs, model) = build_model(&config)?;
        let collator = Collator::new(&config);

        let examples = vec![
            Example::new(words("Steve Jobs founded Apple in California"))
                .with_entities(vec![
                    EntitySpan::new(0, 1, "person"),
                    EntitySpan::new(3, 3, "organization"),
                    EntitySpan::new(5, 5, "location"),
                ]),
            Example::new(words("Marie Curie worked in Paris at the Sorbonne"))
                .with_entities(vec![
                    EntitySpan::new(0, 1, "person"),
                    EntitySpan::new(4, 4, "location"),
                    EntitySpan::new(7, 7, "organization"),
                ]),
        ];
        let batch =
            collator.collate_with_types(&examples, &["founded", "located in", "works at", "born in"])?;
        let output = tch::no_grad(|| model.compute_scores(&batch, false))?;

        assert_eq!(output.scores.size(), vec![2, 3, 4]);
        let loss = f64::try_from(model.forward_loss(&batch, false)?)?;
        assert!(loss.is_finite());
    }
    Ok(())
}

#[test]
fn words_beyond_the_token_budget_are_not_scored() -> anyhow::Result<()> {
    let config = small_config(TaskMode::Ner);
    let collator = Collator::new(&config);
    let labels = ["person", "organization"];
    let text = words("Steve Jobs founded Apple in Cupertino , California");
    let example = Example::new(text.clone()).with_entities(vec![
        EntitySpan::new(0, 1, "person"),
        EntitySpan::new(3, 3, "organization"),
    ]);

    //    5 prompt positions and 3 text words fit in the budget
    let (_vs, model) = build_model_with_budget(&config, 0, Some(8))?;
    let batch = collator.collate_with_types(&[example], &labels)?;
    let output = tch::no_grad(|| model.compute_scores(&batch, false))?;
    assert_eq!(output.valid_lengths, vec![3]);

    let candidate_mask = Vec::<bool>::try_from(output.candidate_mask.reshape([-1]))?;
    let max_width = config.max_width as usize;
    assert_eq!(candidate_mask.len(), text.len() * max_width);
    for (candidate, valid) in candidate_mask.iter().enumerate() {
        let end = candidate / max_width + candidate % max_width;
        assert_eq!(*valid, end < 3, "candidate {candidate}");
    }

    //    Same loss as the visible prefix alone: the organization is out of reach
    let prefix = Example::new(text[..3].to_vec())
        .with_entities(vec![EntitySpan::new(0, 1, "person")]);
    let (_vs, reference) = build_model_with_budget(&config, 0, None)?;
    let prefix_batch = collator.collate_with_types(&[prefix], &labels)?;
    let loss = f64::try_from(tch::no_grad(|| model.forward_loss(&batch, false))?)?;
    let prefix_loss =
        f64::try_from(tch::no_grad(|| reference.forward_loss(&prefix_batch, false))?)?;
    assert!((loss - prefix_loss).abs() < 1e-4 * prefix_loss.abs().max(1.0));
    Ok(())
}

#[test]
fn relation_pairs_beyond_the_token_budget_are_masked() -> anyhow::Result<()> {
    let config = small_config(TaskMode::Relation);
    let collator = Collator::new(&config);
    let (_vs, model) = build_model_with_budget(&config, 0, Some(10))?;

    //    Prompt of 5 positions leaves 5 encoded words
    let example = Example::new(words("Steve Jobs founded Apple in Cupertino")).with_entities(vec![
        EntitySpan::new(0, 1, "person"),
        EntitySpan::new(3, 3, "organization"),
        EntitySpan::new(5, 5, "location"),
    ]);
    let batch = collator.collate_with_types(&[example], &["founded", "located in"])?;
    let output = tch::no_grad(|| model.compute_scores(&batch, false))?;
    assert_eq!(output.valid_lengths, vec![5]);
    //    (person, organization), (person, location), (organization, location)
    assert_eq!(
        Vec::<bool>::try_from(output.candidate_mask.reshape([-1]))?,
        vec![true, false, false]
    );
    Ok(())
}
