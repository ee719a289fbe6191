use std::{cmp::Ordering, collections::BTreeMap};

use rand::{SeedableRng, distributions::Distribution, distributions::WeightedIndex, rngs::StdRng};
use serde_json::Value;

use crate::{
    config::ModelKind,
    error::ServiceError,
    model::{GenerationRequest, codec::SpecialTokens},
};

/// Next-token scoring against a loaded model.
pub trait LanguageModel: Send + Sync {
    fn kind(&self) -> ModelKind;

    /// Returns one row of vocabulary logits per sequence.
    ///
    /// `context` holds the encoder input for seq2seq models and is empty for
    /// causal models. All `sequences` have the same length.
    fn next_token_logits(
        &self,
        context: &[i64],
        sequences: &[Vec<i64>],
    ) -> Result<Vec<Vec<f32>>, ServiceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub num_beams: usize,
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub repetition_penalty: f64,
    pub seed: Option<u64>,
    /// Options with no named field; carried along but not interpreted.
    pub extra: BTreeMap<String, Value>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 50,
            num_beams: 1,
            max_new_tokens: 20,
            do_sample: false,
            repetition_penalty: 1.0,
            seed: None,
            extra: BTreeMap::new(),
        }
    }
}

impl GenerationConfig {
    pub fn from_request(
        request: &GenerationRequest,
        default_seed: Option<u64>,
    ) -> Result<Self, ServiceError> {
        let mut config = Self {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            num_beams: request.num_beams,
            max_new_tokens: request.max_new_tokens,
            seed: default_seed,
            ..Self::default()
        };

        for (key, value) in &request.options {
            match key.as_str() {
                "do_sample" => {
                    config.do_sample = value
                        .as_bool()
                        .ok_or_else(|| invalid_option(key, "a boolean"))?;
                }
                "repetition_penalty" => {
                    let penalty = value
                        .as_f64()
                        .filter(|p| *p > 0.0)
                        .ok_or_else(|| invalid_option(key, "a positive number"))?;
                    config.repetition_penalty = penalty;
                }
                "seed" => {
                    config.seed = Some(
                        value
                            .as_u64()
                            .ok_or_else(|| invalid_option(key, "an unsigned integer"))?,
                    );
                }
                _ => {
                    tracing::warn!(option = %key, "ignoring unrecognised generation option");
                    config.extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(config)
    }
}

fn invalid_option(key: &str, expected: &str) -> ServiceError {
    ServiceError::BadRequest(format!("generation option `{key}` must be {expected}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSequence {
    /// Full sequence: prompt + continuation for causal models, decoder ids for seq2seq.
    pub tokens: Vec<i64>,
    /// Log-probability of each generated token.
    pub token_scores: Vec<f32>,
    pub score: f64,
}

impl GeneratedSequence {
    pub fn generated_len(&self) -> usize {
        self.token_scores.len()
    }

    fn normalized_score(&self) -> f64 {
        self.score / self.generated_len().max(1) as f64
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Best sequence first.
    pub sequences: Vec<GeneratedSequence>,
}

impl GenerationOutput {
    pub fn first(&self) -> Result<&GeneratedSequence, ServiceError> {
        self.sequences
            .first()
            .ok_or_else(|| ServiceError::Inference("generation produced no sequences".into()))
    }
}

pub fn generate(
    model: &dyn LanguageModel,
    prompt_ids: &[i64],
    special: &SpecialTokens,
    config: &GenerationConfig,
) -> Result<GenerationOutput, ServiceError> {
    let (context, mut start): (&[i64], Vec<i64>) = match model.kind() {
        ModelKind::Causal => (&[], prompt_ids.to_vec()),
        ModelKind::Seq2Seq => (prompt_ids, vec![special.decoder_start]),
    };
    if start.is_empty() {
        start.push(special.bos.unwrap_or(special.pad));
    }

    if config.num_beams > 1 {
        beam_search(model, context, start, special.eos, config)
    } else {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sequence = decode_single(model, context, start, special.eos, config, &mut rng)?;
        Ok(GenerationOutput {
            sequences: vec![sequence],
        })
    }
}

fn decode_single(
    model: &dyn LanguageModel,
    context: &[i64],
    start: Vec<i64>,
    eos: Option<i64>,
    config: &GenerationConfig,
    rng: &mut StdRng,
) -> Result<GeneratedSequence, ServiceError> {
    let mut sequence = GeneratedSequence {
        tokens: start,
        token_scores: Vec::with_capacity(config.max_new_tokens),
        score: 0.0,
    };

    for _ in 0..config.max_new_tokens {
        let mut row = single_row(model.next_token_logits(context, std::slice::from_ref(&sequence.tokens))?)?;
        apply_repetition_penalty(&mut row, &sequence.tokens, config.repetition_penalty);

        let next = if config.do_sample {
            warp_logits(&mut row, config.temperature, config.top_k, config.top_p);
            sample_index(&row, rng)?
        } else {
            argmax(&row)
        };

        let log_prob = log_softmax(&row)[next];
        let token = next as i64;
        sequence.tokens.push(token);
        sequence.token_scores.push(log_prob);
        sequence.score += log_prob as f64;

        if Some(token) == eos {
            break;
        }
    }

    Ok(sequence)
}

fn beam_search(
    model: &dyn LanguageModel,
    context: &[i64],
    start: Vec<i64>,
    eos: Option<i64>,
    config: &GenerationConfig,
) -> Result<GenerationOutput, ServiceError> {
    let num_beams = config.num_beams;
    let mut beams = vec![GeneratedSequence {
        tokens: start,
        token_scores: Vec::new(),
        score: 0.0,
    }];
    let mut finished: Vec<GeneratedSequence> = Vec::new();

    for _ in 0..config.max_new_tokens {
        let sequences: Vec<Vec<i64>> = beams.iter().map(|b| b.tokens.clone()).collect();
        let rows = model.next_token_logits(context, &sequences)?;
        if rows.len() != beams.len() {
            return Err(ServiceError::Inference(format!(
                "model returned {} logit rows for {} beams",
                rows.len(),
                beams.len()
            )));
        }

        // (cumulative score, beam index, token, token log-prob)
        let mut candidates: Vec<(f64, usize, usize, f32)> = Vec::new();
        for (beam_idx, (beam, mut row)) in beams.iter().zip(rows).enumerate() {
            apply_repetition_penalty(&mut row, &beam.tokens, config.repetition_penalty);
            if config.do_sample {
                apply_temperature(&mut row, config.temperature);
            }
            let log_probs = log_softmax(&row);
            for token in top_indices(&log_probs, 2 * num_beams) {
                let lp = log_probs[token];
                candidates.push((beam.score + lp as f64, beam_idx, token, lp));
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut next_beams = Vec::with_capacity(num_beams);
        for (rank, (score, beam_idx, token, lp)) in candidates.into_iter().enumerate() {
            let parent = &beams[beam_idx];
            let token = token as i64;
            let mut tokens = parent.tokens.clone();
            tokens.push(token);
            let mut token_scores = parent.token_scores.clone();
            token_scores.push(lp);
            let candidate = GeneratedSequence {
                tokens,
                token_scores,
                score,
            };

            if Some(token) == eos {
                if rank < num_beams {
                    finished.push(candidate);
                }
            } else {
                next_beams.push(candidate);
            }
            if next_beams.len() == num_beams {
                break;
            }
        }

        finished.sort_by(|a, b| b.normalized_score().total_cmp(&a.normalized_score()));
        finished.truncate(num_beams);
        beams = next_beams;

        if beams.is_empty() || search_is_done(&finished, &beams, num_beams) {
            break;
        }
    }

    finished.extend(beams);
    finished.sort_by(|a, b| b.normalized_score().total_cmp(&a.normalized_score()));
    finished.truncate(num_beams);
    Ok(GenerationOutput {
        sequences: finished,
    })
}

/// No live beam can still beat the worst kept hypothesis.
fn search_is_done(finished: &[GeneratedSequence], live: &[GeneratedSequence], num_beams: usize) -> bool {
    if finished.len() < num_beams {
        return false;
    }
    let worst_finished = finished
        .iter()
        .map(GeneratedSequence::normalized_score)
        .fold(f64::INFINITY, f64::min);
    let best_live = live
        .iter()
        .map(GeneratedSequence::normalized_score)
        .fold(f64::NEG_INFINITY, f64::max);
    best_live <= worst_finished
}

fn single_row(rows: Vec<Vec<f32>>) -> Result<Vec<f32>, ServiceError> {
    rows.into_iter()
        .next()
        .filter(|row| !row.is_empty())
        .ok_or_else(|| ServiceError::Inference("model returned no logits".into()))
}

fn apply_repetition_penalty(row: &mut [f32], history: &[i64], penalty: f64) {
    if penalty == 1.0 {
        return;
    }
    let penalty = penalty as f32;
    let mut seen = history.to_vec();
    seen.sort_unstable();
    seen.dedup();
    for token in seen {
        if let Some(logit) = usize::try_from(token).ok().and_then(|t| row.get_mut(t)) {
            *logit = if *logit > 0.0 {
                *logit / penalty
            } else {
                *logit * penalty
            };
        }
    }
}

fn apply_temperature(row: &mut [f32], temperature: f64) {
    if temperature > 0.0 && temperature != 1.0 {
        let temperature = temperature as f32;
        row.iter_mut().for_each(|logit| *logit /= temperature);
    }
}

/// Temperature, then top-k, then nucleus filtering. Filtered logits become -inf.
fn warp_logits(row: &mut [f32], temperature: f64, top_k: usize, top_p: f64) {
    apply_temperature(row, temperature);

    if top_k > 0 && top_k < row.len() {
        let keep = top_indices(row, top_k);
        let mut mask = vec![false; row.len()];
        keep.into_iter().for_each(|i| mask[i] = true);
        for (logit, keep) in row.iter_mut().zip(mask) {
            if !keep {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    if top_p < 1.0 {
        let probs = softmax(row);
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

        let mut cumulative = 0.0f32;
        let mut kept = 0usize;
        for &idx in &order {
            cumulative += probs[idx];
            kept += 1;
            if cumulative as f64 >= top_p {
                break;
            }
        }
        for &idx in order.iter().skip(kept.max(1)) {
            row[idx] = f32::NEG_INFINITY;
        }
    }
}

fn sample_index(row: &[f32], rng: &mut StdRng) -> Result<usize, ServiceError> {
    let probs = softmax(row);
    let dist = WeightedIndex::new(&probs)
        .map_err(|e| ServiceError::Inference(format!("cannot sample from logits: {e}")))?;
    Ok(dist.sample(rng))
}

fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

fn top_indices(row: &[f32], n: usize) -> Vec<usize> {
    let descending = |a: &usize, b: &usize| -> Ordering { row[*b].total_cmp(&row[*a]) };
    let mut indices: Vec<usize> = (0..row.len()).collect();
    if n < indices.len() {
        indices.select_nth_unstable_by(n, descending);
        indices.truncate(n);
    }
    indices.sort_by(descending);
    indices
}

fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn log_softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = row.iter().map(|&l| (l - max).exp()).sum::<f32>().ln() + max;
    row.iter().map(|&l| l - log_sum).collect()
}
