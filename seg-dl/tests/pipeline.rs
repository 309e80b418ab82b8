use anyhow::Result;
use seg_dl::{
    dataset::{BatchPolicy, OnDemandDataset, PartitionBuilder, ShardSampler, ShardedDataSource},
    loss::{convert_to_binary, CrossEntropyLoss, IouMetric},
    model::{freeze_except, ConvSegmenter, SegmentationModel},
    SegError,
};
use std::{path::Path, sync::Arc};
use tch::{
    nn::{self, OptimizerConfig},
    vision, Device, Kind, Tensor,
};

const SIZE: i64 = 16;

/// Writes `n` random images and trimaps whose left half is background.
fn write_dataset(dir: &Path, n: usize) -> Result<()> {
    let image_dir = dir.join("images");
    let mask_dir = dir.join("masks");
    std::fs::create_dir_all(&image_dir)?;
    std::fs::create_dir_all(&mask_dir)?;

    for index in 0..n {
        let image = Tensor::randint(256, &[3, SIZE, SIZE], (Kind::Uint8, Device::Cpu));
        vision::image::save(&image, image_dir.join(format!("{:03}.jpg", index)))?;

        let trimap = Tensor::ones(&[3, SIZE, SIZE], (Kind::Uint8, Device::Cpu));
        let _ = trimap.narrow(2, 0, SIZE / 2).fill_(2);
        vision::image::save(&trimap, mask_dir.join(format!("{:03}.png", index)))?;
    }
    Ok(())
}

#[test]
fn load_sharded_batches() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_dataset(dir.path(), 10)?;

    let partition = PartitionBuilder::new(dir.path().join("images"), dir.path().join("masks"))
        .split_rate(0.2)
        .seed(3)
        .build()?;
    assert_eq!(partition.test.len(), 2);
    assert_eq!(partition.train.len(), 8);

    let dataset = Arc::new(OnDemandDataset::new(partition.train, SIZE as usize)?);
    let sampler = ShardSampler::new(8, 1, 3, BatchPolicy::Pad)?;
    let source = ShardedDataSource::new(dataset, sampler, 2, 0)?;
    assert_eq!(source.num_batches(), 2);

    // rank 1 owns records 3..6 and yields them in batches of two
    let batches: Vec<_> = source.iter().collect::<Result<_>>()?;
    assert_eq!(batches.len(), 2);
    for (batch, size) in batches.iter().zip([2, 1]) {
        assert_eq!(batch.batch_size(), size);
        assert_eq!(batch.images.size(), vec![size as i64, 3, SIZE, SIZE]);
        assert_eq!(batch.images.kind(), Kind::Float);
        assert_eq!(batch.masks.size(), vec![size as i64, 3, SIZE, SIZE]);
        assert_eq!(batch.masks.kind(), Kind::Uint8);

        // the right half is foreground
        let labels = convert_to_binary(&batch.masks)?;
        let foreground = labels.sum(Kind::Int64).int64_value(&[]);
        assert_eq!(foreground, size as i64 * SIZE * SIZE / 2);
    }

    Ok(())
}

#[test]
fn skip_hidden_and_foreign_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_dataset(dir.path(), 5)?;
    let image_dir = dir.path().join("images");
    let mask_dir = dir.path().join("masks");
    std::fs::write(mask_dir.join(".hidden.png"), b"")?;
    std::fs::write(mask_dir.join("x.txt"), b"")?;
    std::fs::write(image_dir.join(".hidden.jpg"), b"")?;
    std::fs::write(image_dir.join("notes.png"), b"")?;

    let partition = PartitionBuilder::new(&image_dir, &mask_dir)
        .split_rate(0.2)
        .build()?;
    assert_eq!(partition.len(), 5);

    for pair in partition.train.iter().chain(&partition.test) {
        let image_name = pair.image.file_name().unwrap().to_string_lossy();
        let mask_name = pair.mask.file_name().unwrap().to_string_lossy();
        assert!(!image_name.starts_with('.') && image_name.ends_with(".jpg"));
        assert!(!mask_name.starts_with('.') && mask_name.ends_with(".png"));
    }
    Ok(())
}

#[test]
fn same_seed_same_split() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_dataset(dir.path(), 12)?;
    let builder = PartitionBuilder::new(dir.path().join("images"), dir.path().join("masks"))
        .split_rate(0.25)
        .seed(11);

    let first = builder.clone().build()?;
    let second = builder.build()?;
    assert_eq!(first, second);
    assert_eq!(first.test.len(), 3);

    // every image keeps its own mask
    for pair in first.train.iter().chain(&first.test) {
        assert_eq!(pair.image.file_stem(), pair.mask.file_stem());
    }
    Ok(())
}

#[test]
fn reject_unpaired_directories() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_dataset(dir.path(), 4)?;
    std::fs::remove_file(dir.path().join("masks").join("002.png"))?;

    let err = PartitionBuilder::new(dir.path().join("images"), dir.path().join("masks"))
        .build()
        .unwrap_err();
    assert!(matches!(SegError::find(&err), Some(SegError::DataIntegrity(_))));
    Ok(())
}

#[test]
fn train_step_reduces_loss() -> Result<()> {
    tch::manual_seed(1);
    let mut model = ConvSegmenter::new(Device::Cpu, 8);
    freeze_except(model.var_store(), "classifier")?;
    let mut optimizer = nn::Adam::default().build(model.var_store(), 1e-2)?;

    let images = Tensor::rand(&[4, 3, SIZE, SIZE], (Kind::Float, Device::Cpu));
    let labels = images.select(1, 0).gt(0.5).to_kind(Kind::Int64);
    let criterion = CrossEntropyLoss::default();

    let mut losses = vec![];
    for _ in 0..30 {
        optimizer.zero_grad();
        let logits = model.forward_t(&images, true)?;
        let loss = criterion.forward(&logits, &labels)?;
        model.backward(&loss)?;
        optimizer.step();
        losses.push(loss.double_value(&[]));
    }
    assert!(losses.last().unwrap() < losses.first().unwrap());

    let logits = tch::no_grad(|| model.forward_t(&images, false))?;
    let iou = IouMetric.forward(&logits, &labels)?;
    assert_eq!(iou.thresholded.size(), vec![4]);
    Ok(())
}
