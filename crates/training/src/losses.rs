//! Named loss bookkeeping and the two training objectives.

use burn::tensor::backend::Backend;
use models::LossValue;

/// Terms added to `G_GAN` when the model reports them.
pub const GENERATOR_TERMS: [&str; 5] = [
    "G_GAN_Feat",
    "G_VGG",
    "G_Feat_L2",
    "Smooth_L1",
    "G_Feat_L2_Stage_1",
];

/// Loss values keyed by name, in the order the model reported them.
#[derive(Debug, Clone)]
pub struct LossDict<B: Backend> {
    entries: Vec<(String, LossValue<B>)>,
}

impl<B: Backend> LossDict<B> {
    /// Pair names with values by position; per-device entries are averaged.
    pub fn from_lists(names: &[String], losses: Vec<LossValue<B>>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            names.len() == losses.len(),
            "model reported {} losses for {} loss names",
            losses.len(),
            names.len()
        );
        let entries = names
            .iter()
            .cloned()
            .zip(losses.into_iter().map(LossValue::reduce_mean))
            .collect();
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&LossValue<B>> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn required(&self, name: &str) -> anyhow::Result<LossValue<B>> {
        self.get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("loss {name} missing from model output"))
    }

    /// `0.5 * (D_fake + D_real)`
    pub fn discriminator_loss(&self) -> anyhow::Result<LossValue<B>> {
        let fake = self.required("D_fake")?;
        let real = self.required("D_real")?;
        Ok(fake.add(real).scale(0.5))
    }

    /// `G_GAN` plus whichever of [`GENERATOR_TERMS`] are present.
    pub fn generator_loss(&self) -> anyhow::Result<LossValue<B>> {
        let mut total = self.required("G_GAN")?;
        for name in GENERATOR_TERMS {
            if let Some(term) = self.get(name) {
                total = total.add(term.clone());
            }
        }
        Ok(total)
    }

    /// Host-side values for logging.
    pub fn errors(&self) -> Vec<(String, f32)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.clone(), value.value()))
            .collect()
    }
}
