//! 構造データと記述子の読み込み
//!
//! 構造ファイルの解析と記述子の計算は外部に任せ、ここではタグの列挙・
//! 記述子キャッシュの管理・タグごとのデータセット構築を行う。

use crate::comm::{Communicator, agree};
use crate::config::Config;
use crate::dataset::{TaggedDataset, stream_rng};
use crate::error::{Error, Result};
use crate::io::{open_reader, read_json, write_json};
use crate::structure::{Descriptor, Order, Sample, Structure};
use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// タグディレクトリ内の構造ファイル名
pub const STRUCTURE_FILE: &str = "structures.jsonl";

/// 構造データの供給元
pub trait StructureSource {
    /// タグ名 → データファイル
    fn tags(&self) -> Result<BTreeMap<String, PathBuf>>;

    fn read(&self, tag: &str, path: &Path) -> Result<Vec<Structure>>;
}

/// 記述子の生成器
pub trait DescriptorGenerator {
    /// キャッシュファイル名に使う
    fn name(&self) -> &str;

    fn generate(&self, tag: &str, structures: &[Structure], order: Order) -> Result<Vec<Descriptor>>;
}

/// `<root>/<tag>/structures.jsonl` (1行1構造の JSON)
pub struct JsonlSource {
    root: PathBuf,
}

impl JsonlSource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl StructureSource for JsonlSource {
    fn tags(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut tags = BTreeMap::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path().join(STRUCTURE_FILE);
            if !path.is_file() {
                continue;
            }
            if let Some(tag) = entry.file_name().to_str() {
                tags.insert(tag.to_string(), path);
            }
        }
        Ok(tags)
    }

    fn read(&self, tag: &str, path: &Path) -> Result<Vec<Structure>> {
        let reader = open_reader(path)?;
        let mut structures = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let structure: Structure = serde_json::from_str(&line).map_err(|e| {
                Error::dataset(tag, format!("{}:{}: {e}", path.display(), lineno + 1))
            })?;
            structure.validate(tag)?;
            structures.push(structure);
        }
        Ok(structures)
    }
}

/// 事前計算済みのキャッシュだけを使う生成器
///
/// キャッシュがなければエラーにする。
pub struct PrecomputedOnly {
    name: String,
}

impl PrecomputedOnly {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Default for PrecomputedOnly {
    fn default() -> Self {
        Self::new("descriptors")
    }
}

impl DescriptorGenerator for PrecomputedOnly {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, tag: &str, _structures: &[Structure], _order: Order) -> Result<Vec<Descriptor>> {
        Err(Error::dataset(
            tag,
            format!("descriptor cache {}.json.gz is missing", self.name),
        ))
    }
}

/// データファイルと同じディレクトリの `<name>.json.gz`
pub fn cache_path(data_path: &Path, generator: &dyn DescriptorGenerator) -> PathBuf {
    data_path.with_file_name(format!("{}.json.gz", generator.name()))
}

/// 学習対象のデータセット一式
pub struct DatasetPlan {
    /// 学習順
    pub datasets: Vec<TaggedDataset>,
    /// 見つからなかった、または読み込めなかったタグ
    pub skipped: Vec<String>,
    /// 全タグに現れる元素 (ソート済み)
    pub elements: Vec<String>,
    /// 記述子の長さ
    pub n_input: usize,
}

/// 設定に従ってタグごとのデータセットを構築する
///
/// 集団通信を含む。全ランクが呼ぶこと。読み込めないタグは警告して飛ばす。
pub fn construct_datasets(
    config: &Config,
    source: &dyn StructureSource,
    generator: &dyn DescriptorGenerator,
    comm: &dyn Communicator,
) -> Result<DatasetPlan> {
    let available = source.tags()?;
    let requested: Vec<String> = if config.uses_all_tags() {
        available.keys().cloned().collect()
    } else {
        config.dataset.tags.clone()
    };

    let mut datasets: Vec<TaggedDataset> = Vec::new();
    let mut skipped = Vec::new();
    for tag in requested {
        let Some(path) = available.get(&tag) else {
            if comm.is_root() {
                log::warn!("{}", Error::MissingTagData(tag.clone()));
            }
            skipped.push(tag);
            continue;
        };
        if comm.is_root() {
            log::info!("Construct sub dataset tagged as \"{tag}\"");
        }
        match construct_tag(config, source, generator, comm, &tag, path)? {
            Some(dataset) => datasets.push(dataset),
            None => skipped.push(tag),
        }
    }

    let Some(n_input) = datasets.first().and_then(|d| d.n_feature()) else {
        return Err(Error::InvalidConfig("no dataset is available for training".into()));
    };
    if let Some(d) = datasets.iter().find(|d| d.n_feature() != Some(n_input)) {
        return Err(Error::dataset(
            d.tag(),
            format!(
                "descriptor length {:?} differs from {n_input} of the other tags",
                d.n_feature()
            ),
        ));
    }
    let elements: BTreeSet<String> = datasets.iter().flat_map(|d| d.elements()).collect();

    Ok(DatasetPlan {
        datasets,
        skipped,
        elements: elements.into_iter().collect(),
        n_input,
    })
}

/// 1タグ分の構築。どこかのランクで失敗したら全ランクで `None` を返す
fn construct_tag(
    config: &Config,
    source: &dyn StructureSource,
    generator: &dyn DescriptorGenerator,
    comm: &dyn Communicator,
    tag: &str,
    path: &Path,
) -> Result<Option<TaggedDataset>> {
    let loss = &config.model.loss_function;
    let order = loss.descriptor_order();

    let structures = read_structures(source, tag, path, loss.property_order());
    let Some(structures) = settle(comm, "dataset.read", tag, structures)? else {
        return Ok(None);
    };

    let cache = cache_path(path, generator);
    let exists = comm.any("dataset.cache_exists", comm.is_root() && cache.is_file())?;
    if !exists {
        let generated = if comm.is_root() {
            log::info!("Generate descriptors for \"{tag}\" into {}", cache.display());
            generator
                .generate(tag, &structures, order)
                .and_then(|d| Ok(write_json(&cache, &d)?))
        } else {
            Ok(())
        };
        if settle(comm, "dataset.generate", tag, generated)?.is_none() {
            return Ok(None);
        }
    }

    let dataset = load_dataset(config, tag, &cache, &structures, order);
    settle(comm, "dataset.load", tag, dataset)
}

/// 全ランクの成否をそろえる。失敗したランクがあれば全ランクで `None`
fn settle<T>(
    comm: &dyn Communicator,
    site: &str,
    tag: &str,
    result: Result<T>,
) -> Result<Option<T>> {
    let failed = comm.any(site, result.is_err())?;
    match result {
        Err(e) => {
            log::warn!("Skip sub dataset tagged as \"{tag}\": {e}");
            Ok(None)
        }
        Ok(_) if failed => {
            if comm.is_root() {
                log::warn!("Skip sub dataset tagged as \"{tag}\": failed on another rank");
            }
            Ok(None)
        }
        Ok(value) => Ok(Some(value)),
    }
}

fn read_structures(
    source: &dyn StructureSource,
    tag: &str,
    path: &Path,
    property_order: Order,
) -> Result<Vec<Structure>> {
    let structures = source.read(tag, path)?;
    let Some(first) = structures.first() else {
        return Err(Error::dataset(tag, "no structures"));
    };
    let composition = &first.elements;
    for (i, s) in structures.iter().enumerate() {
        if &s.elements != composition {
            return Err(Error::dataset(
                tag,
                format!("structure {i} has a different elemental composition"),
            ));
        }
        if property_order >= Order::Force && s.forces.is_empty() {
            return Err(Error::dataset(tag, format!("structure {i} has no force labels")));
        }
    }
    Ok(structures)
}

fn load_dataset(
    config: &Config,
    tag: &str,
    cache: &Path,
    structures: &[Structure],
    order: Order,
) -> Result<TaggedDataset> {
    let descriptors: Vec<Descriptor> = read_json(cache).map_err(|e| {
        Error::dataset(
            tag,
            format!("cannot read descriptor cache {}: {e}", cache.display()),
        )
    })?;
    if descriptors.len() != structures.len() {
        return Err(Error::dataset(
            tag,
            format!(
                "{} descriptors for {} structures",
                descriptors.len(),
                structures.len()
            ),
        ));
    }
    let mut samples = Vec::with_capacity(structures.len());
    for (i, (structure, descriptor)) in structures.iter().zip(descriptors).enumerate() {
        if descriptor.order() < order {
            return Err(Error::dataset(
                tag,
                format!(
                    "descriptor {i} provides {:?}, {order:?} is required",
                    descriptor.order()
                ),
            ));
        }
        samples.push(Sample::new(structure, descriptor));
    }

    let composition = structures[0].elements.clone();
    let mut dataset = TaggedDataset::new(tag, composition, samples)?;
    dataset.shuffle(&mut stream_rng(config.dataset.seed, tag, "construct", 0, 0));

    let n_train = (dataset.len() as f64 * config.training.train_test_ratio).floor() as usize;
    if n_train == 0 {
        return Err(Error::dataset(
            tag,
            format!("{} structures leave no training samples", dataset.len()),
        ));
    }
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcess;

    struct ConstantGenerator;

    impl DescriptorGenerator for ConstantGenerator {
        fn name(&self) -> &str {
            "constant"
        }

        fn generate(&self, _tag: &str, structures: &[Structure], _order: Order) -> Result<Vec<Descriptor>> {
            Ok(structures
                .iter()
                .map(|s| Descriptor {
                    n_atom: s.n_atom(),
                    n_feature: 2,
                    values: s.positions.iter().flat_map(|p| [p[0], p[1]]).collect(),
                    first: None,
                    second: None,
                })
                .collect())
        }
    }

    fn write_tag(root: &Path, tag: &str, elements: &[&str], n: usize) {
        let dir = root.join(tag);
        std::fs::create_dir_all(&dir).unwrap();
        let lines: Vec<String> = (0..n)
            .map(|i| {
                let s = Structure {
                    elements: elements.iter().map(|e| e.to_string()).collect(),
                    positions: (0..elements.len()).map(|a| [i as f64, a as f64, 0.0]).collect(),
                    energy: i as f64,
                    forces: vec![[0.0; 3]; elements.len()],
                };
                serde_json::to_string(&s).unwrap()
            })
            .collect();
        std::fs::write(dir.join(STRUCTURE_FILE), lines.join("\n")).unwrap();
    }

    fn config(root: &Path, tags: &str) -> Config {
        Config::from_toml_str(&format!(
            r#"
[dataset]
root = "{}"
tags = {tags}

[model]
layers = [{{ nodes = 1, activation = "identity" }}]
loss_function = {{ name = "zeroth" }}

[training]
out_dir = "out"
batch_size = 2
epoch = 1
patience = 1
init_lr = 1.0e-3
"#,
            root.display()
        ))
        .unwrap()
    }

    #[test]
    fn test_all_tags_sorted_and_cache_written() {
        let dir = tempfile::tempdir().unwrap();
        write_tag(dir.path(), "B", &["H", "O"], 4);
        write_tag(dir.path(), "A", &["H", "H"], 4);
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let config = config(dir.path(), r#"["all"]"#);
        let source = JsonlSource::new(dir.path());
        let plan =
            construct_datasets(&config, &source, &ConstantGenerator, &SingleProcess::new(false))
                .unwrap();
        let tags: Vec<&str> = plan.datasets.iter().map(|d| d.tag()).collect();
        assert_eq!(tags, vec!["A", "B"]);
        assert_eq!(plan.elements, vec!["H".to_string(), "O".to_string()]);
        assert_eq!(plan.n_input, 2);
        assert!(dir.path().join("A").join("constant.json.gz").is_file());

        // キャッシュがあれば生成器は呼ばれない
        let plan = construct_datasets(
            &config,
            &source,
            &PrecomputedOnly::new("constant"),
            &SingleProcess::new(false),
        )
        .unwrap();
        assert_eq!(plan.datasets.len(), 2);
    }

    #[test]
    fn test_missing_tag_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_tag(dir.path(), "A", &["H"], 3);
        let config = config(dir.path(), r#"["C", "A"]"#);
        let plan = construct_datasets(
            &config,
            &JsonlSource::new(dir.path()),
            &ConstantGenerator,
            &SingleProcess::new(false),
        )
        .unwrap();
        assert_eq!(plan.skipped, vec!["C".to_string()]);
        assert_eq!(plan.datasets.len(), 1);
    }

    #[test]
    fn test_missing_cache_without_generator() {
        let dir = tempfile::tempdir().unwrap();
        write_tag(dir.path(), "A", &["H"], 3);
        let config = config(dir.path(), r#"["A"]"#);
        let err = construct_datasets(
            &config,
            &JsonlSource::new(dir.path()),
            &PrecomputedOnly::default(),
            &SingleProcess::new(false),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_mixed_composition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_tag(dir.path(), "A", &["H"], 2);
        let path = dir.path().join("A").join(STRUCTURE_FILE);
        let extra = Structure {
            elements: vec!["O".into()],
            positions: vec![[0.0; 3]],
            energy: 0.0,
            forces: vec![[0.0; 3]],
        };
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push('\n');
        text.push_str(&serde_json::to_string(&extra).unwrap());
        std::fs::write(&path, text).unwrap();

        let result = read_structures(&JsonlSource::new(dir.path()), "A", &path, Order::Energy);
        assert!(matches!(result, Err(Error::Dataset { .. })));
    }
}
