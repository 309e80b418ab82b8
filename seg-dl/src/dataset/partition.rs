use super::*;
use crate::{common::*, error::SegError};

/// Shuffled and split image/mask pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub train: Vec<ImageMaskPair>,
    pub test: Vec<ImageMaskPair>,
}

impl Partition {
    /// Number of pairs in both subsets.
    pub fn len(&self) -> usize {
        self.train.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds a reproducible train/test split from an image directory and a
/// mask directory.
#[derive(Debug, Clone)]
pub struct PartitionBuilder {
    pub image_dir: PathBuf,
    pub mask_dir: PathBuf,
    /// File extension of images without the dot.
    pub image_extension: String,
    /// File extension of masks without the dot.
    pub mask_extension: String,
    /// Fraction of the shuffled pairs assigned to the test subset.
    pub split_rate: f64,
    pub seed: u64,
}

impl PartitionBuilder {
    pub fn new(image_dir: impl AsRef<Path>, mask_dir: impl AsRef<Path>) -> Self {
        Self {
            image_dir: image_dir.as_ref().to_owned(),
            mask_dir: mask_dir.as_ref().to_owned(),
            image_extension: "jpg".into(),
            mask_extension: "png".into(),
            split_rate: 0.2,
            seed: 0,
        }
    }

    pub fn split_rate(self, split_rate: f64) -> Self {
        Self { split_rate, ..self }
    }

    pub fn seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }

    /// Lists both directories and builds the partition.
    pub fn build(&self) -> Result<Partition> {
        let images = list_files(&self.image_dir, &self.image_extension)?;
        let masks = list_files(&self.mask_dir, &self.mask_extension)?;

        if images.len() != masks.len() {
            return Err(SegError::data_integrity(format!(
                "found {} images in '{}' but {} masks in '{}'",
                images.len(),
                self.image_dir.display(),
                masks.len(),
                self.mask_dir.display()
            ))
            .into());
        }

        let pairs = izip!(images, masks)
            .map(|(image, mask)| ImageMaskPair { image, mask })
            .collect();
        self.split(pairs)
    }

    /// Shuffles the pairs with the seeded generator and splits them.
    ///
    /// The first `floor(split_rate * N)` shuffled pairs become the test
    /// subset, the rest become the train subset.
    pub fn split(&self, mut pairs: Vec<ImageMaskPair>) -> Result<Partition> {
        let split_rate = self.split_rate;
        if !(0.0..1.0).contains(&split_rate) {
            return Err(SegError::configuration(format!(
                "split_rate must be in range [0, 1), but get {}",
                split_rate
            ))
            .into());
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        pairs.shuffle(&mut rng);

        let num_test = (split_rate * pairs.len() as f64).floor() as usize;
        let train = pairs.split_off(num_test);
        let test = pairs;

        Ok(Partition { train, test })
    }
}

/// Lists non-hidden files with the extension, sorted by path.
fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|err| {
        SegError::data_integrity(format!(
            "unable to read directory '{}': {}",
            dir.display(),
            err
        ))
    })?;

    let mut paths: Vec<_> = entries
        .map(|entry| -> Result<_> {
            let path = entry?.path();
            let is_hidden = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with('.'))
                .unwrap_or(true);
            let matches = path.extension().and_then(|ext| ext.to_str()) == Some(extension);
            Ok((!is_hidden && matches && path.is_file()).then(|| path))
        })
        .filter_map(|result| result.transpose())
        .try_collect()?;
    paths.sort();

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(n: usize) -> Vec<ImageMaskPair> {
        (0..n)
            .map(|index| ImageMaskPair {
                image: PathBuf::from(format!("images/{:04}.jpg", index)),
                mask: PathBuf::from(format!("masks/{:04}.png", index)),
            })
            .collect()
    }

    #[test]
    fn split_sizes() -> Result<()> {
        let builder = PartitionBuilder::new("images", "masks");

        let partition = builder.clone().split_rate(0.2).split(pairs(10))?;
        assert_eq!(partition.test.len(), 2);
        assert_eq!(partition.train.len(), 8);

        for &split_rate in &[0.0, 0.1, 0.33, 0.5, 0.75, 0.999] {
            for n in 0..25 {
                let partition = builder.clone().split_rate(split_rate).split(pairs(n))?;
                assert_eq!(partition.len(), n);
                assert_eq!(
                    partition.test.len(),
                    (split_rate * n as f64).floor() as usize
                );
            }
        }

        Ok(())
    }

    #[test]
    fn split_is_seeded() -> Result<()> {
        let builder = PartitionBuilder::new("images", "masks").seed(7);
        let lhs = builder.split(pairs(50))?;
        let rhs = builder.split(pairs(50))?;
        assert_eq!(lhs, rhs);

        let other = builder.clone().seed(8).split(pairs(50))?;
        assert_ne!(lhs, other);
        Ok(())
    }

    #[test]
    fn shuffle_keeps_pairing() -> Result<()> {
        let partition = PartitionBuilder::new("images", "masks").split(pairs(40))?;

        let all = partition.test.iter().chain(&partition.train).collect_vec();
        assert_eq!(all.iter().unique().count(), 40);
        for pair in all {
            assert_eq!(pair.image.file_stem(), pair.mask.file_stem());
        }
        Ok(())
    }

    #[test]
    fn reject_invalid_split_rate() {
        for &split_rate in &[-0.1, 1.0, 1.5] {
            let err = PartitionBuilder::new("images", "masks")
                .split_rate(split_rate)
                .split(pairs(10))
                .unwrap_err();
            assert!(matches!(
                SegError::find(&err),
                Some(SegError::Configuration(_))
            ));
        }
    }
}
