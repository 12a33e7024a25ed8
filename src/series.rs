//! Test series files.
//!
//! A file holds one test set or a list of them. Each set names lists of
//! values; the loader expands their cross product into descriptors numbered
//! from 1 in file order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::completion::WaitStrategy;
use crate::control::{ClassFunction, TestDescriptor, TestType};
use crate::error::{FabtestError, Result};
use crate::provider::{AvType, Caps, CompletionKind, EpType, Mode, MrMode};
use crate::transfer::RmaOp;

/// Environment variable naming the directory that holds `test_configs/`.
pub const CONFIG_PATH_ENV: &str = "FABTEST_CONFIG_PATH";

fn default_test_type() -> Vec<TestType> {
    vec![TestType::Latency]
}

fn default_class_function() -> Vec<ClassFunction> {
    vec![ClassFunction::Send]
}

fn default_ep_type() -> Vec<EpType> {
    vec![EpType::Rdm]
}

fn default_av_type() -> Vec<AvType> {
    vec![AvType::Map]
}

fn default_comp_type() -> Vec<CompletionKind> {
    vec![CompletionKind::Queue]
}

fn default_cq_wait() -> Vec<WaitStrategy> {
    vec![WaitStrategy::Spin]
}

fn default_caps() -> Vec<Vec<String>> {
    vec![vec!["msg".to_string()]]
}

fn default_mode() -> Vec<Vec<String>> {
    vec![Vec::new()]
}

fn default_rma_op() -> Vec<RmaOp> {
    vec![RmaOp::Write]
}

fn default_transfer_size() -> Vec<u64> {
    vec![1024]
}

fn default_timeout() -> i32 {
    10_000
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TestSet {
    #[serde(default)]
    pub prov_name: String,
    #[serde(default)]
    pub fabric_name: String,
    #[serde(default = "default_test_type")]
    pub test_type: Vec<TestType>,
    #[serde(default = "default_class_function")]
    pub class_function: Vec<ClassFunction>,
    #[serde(default = "default_ep_type")]
    pub ep_type: Vec<EpType>,
    #[serde(default = "default_av_type")]
    pub av_type: Vec<AvType>,
    #[serde(default = "default_comp_type")]
    pub comp_type: Vec<CompletionKind>,
    #[serde(default = "default_cq_wait")]
    pub cq_wait: Vec<WaitStrategy>,
    #[serde(default = "default_caps")]
    pub caps: Vec<Vec<String>>,
    #[serde(default = "default_mode")]
    pub mode: Vec<Vec<String>>,
    #[serde(default)]
    pub mr_mode: MrMode,
    /// Only consulted for `rma` class functions.
    #[serde(default = "default_rma_op")]
    pub rma_op: Vec<RmaOp>,
    #[serde(default = "default_transfer_size")]
    pub transfer_size: Vec<u64>,
    #[serde(default)]
    pub iterations: u64,
    #[serde(default)]
    pub verify_data: bool,
    #[serde(default = "default_timeout")]
    pub timeout_ms: i32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeriesFile {
    Many(Vec<TestSet>),
    One(TestSet),
}

pub fn parse_caps(names: &[String]) -> Result<Caps> {
    names.iter().try_fold(Caps::empty(), |caps, name| {
        let bit = match name.as_str() {
            "msg" => Caps::MSG,
            "rma" => Caps::RMA,
            "tagged" => Caps::TAGGED,
            "atomic" => Caps::ATOMIC,
            "read" => Caps::READ,
            "write" => Caps::WRITE,
            "recv" => Caps::RECV,
            "send" => Caps::SEND,
            "remote_read" => Caps::REMOTE_READ,
            "remote_write" => Caps::REMOTE_WRITE,
            other => return Err(FabtestError::Config(format!("unknown capability {}", other))),
        };
        Ok(caps | bit)
    })
}

pub fn parse_mode(names: &[String]) -> Result<Mode> {
    names.iter().try_fold(Mode::empty(), |mode, name| {
        let bit = match name.as_str() {
            "local_mr" => Mode::LOCAL_MR,
            "msg_prefix" => Mode::MSG_PREFIX,
            "context" => Mode::CONTEXT,
            other => return Err(FabtestError::Config(format!("unknown mode {}", other))),
        };
        Ok(mode | bit)
    })
}

impl TestSet {
    fn expand(&self, out: &mut Vec<TestDescriptor>) -> Result<()> {
        let caps = self.caps.iter().map(|c| parse_caps(c)).collect::<Result<Vec<_>>>()?;
        let modes = self.mode.iter().map(|m| parse_mode(m)).collect::<Result<Vec<_>>>()?;
        for &test_type in &self.test_type {
            for &class_function in &self.class_function {
                let rma_ops: Vec<Option<RmaOp>> = match class_function {
                    ClassFunction::Rma => self.rma_op.iter().copied().map(Some).collect(),
                    _ => vec![None],
                };
                for &ep_type in &self.ep_type {
                    for &av_type in &self.av_type {
                        for &comp_type in &self.comp_type {
                            for &cq_wait in &self.cq_wait {
                                for &cap in &caps {
                                    for &mode in &modes {
                                        for &rma_op in &rma_ops {
                                            for &transfer_size in &self.transfer_size {
                                                let mut caps = cap;
                                                if rma_op.is_some() {
                                                    caps |= Caps::RMA;
                                                }
                                                let mut desc = TestDescriptor::default();
                                                desc.test_index = out.len() as u32 + 1;
                                                desc.test_type = test_type;
                                                desc.class_function = class_function;
                                                desc.ep_type = ep_type;
                                                desc.av_type = av_type;
                                                desc.comp_type = comp_type;
                                                desc.cq_wait = cq_wait;
                                                desc.rma_op = rma_op;
                                                desc.mr_mode = self.mr_mode;
                                                desc.caps = caps.bits();
                                                desc.mode = mode.bits();
                                                desc.transfer_size = transfer_size;
                                                desc.iterations = self.iterations;
                                                desc.verify_data = self.verify_data;
                                                desc.timeout_ms = self.timeout_ms;
                                                desc.set_prov_name(&self.prov_name);
                                                desc.set_fabric_name(&self.fabric_name);
                                                out.push(desc);
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Ordered list of test cases.
#[derive(Debug, Clone, Default)]
pub struct TestSeries {
    tests: Vec<TestDescriptor>,
}

impl std::str::FromStr for TestSeries {
    type Err = FabtestError;

    fn from_str(s: &str) -> Result<Self> {
        let file: SeriesFile = serde_json::from_str(s).map_err(|e| FabtestError::Config(format!("test series: {}", e)))?;
        let sets = match file {
            SeriesFile::Many(sets) => sets,
            SeriesFile::One(set) => vec![set],
        };
        let mut tests = Vec::new();
        for set in &sets {
            set.expand(&mut tests)?;
        }
        Ok(TestSeries { tests })
    }
}

impl TestSeries {
    pub fn load(path: &Path) -> Result<TestSeries> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FabtestError::Config(format!("reading {}: {}", path.display(), e)))?;
        let series: TestSeries = text.parse()?;
        log::debug!("loaded {} test cases from {}", series.len(), path.display());
        Ok(series)
    }

    /// `<FABTEST_CONFIG_PATH or .>/test_configs/<provider>/<test>.json`
    pub fn named_path(provider: &str, test: &str) -> PathBuf {
        let root = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| ".".to_string());
        Path::new(&root).join("test_configs").join(provider).join(format!("{}.json", test))
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn tests(&self) -> &[TestDescriptor] {
        &self.tests
    }

    /// Cases with `start <= index <= end`. Zero leaves that bound open.
    pub fn range(&self, start: u32, end: u32) -> Vec<TestDescriptor> {
        let end = if end == 0 { u32::MAX } else { end };
        self.tests
            .iter()
            .filter(|t| t.test_index >= start && t.test_index <= end)
            .cloned()
            .collect()
    }

    /// Points every case at the server's data endpoint.
    pub fn set_destination(&mut self, node: &str, service: &str) {
        for test in &mut self.tests {
            test.set_node(node);
            test.set_service(service);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIES: &str = r#"{
        "prov_name": "udp",
        "class_function": ["send", "rma"],
        "cq_wait": ["spin", "fd"],
        "caps": [["msg"], ["tagged"]],
        "rma_op": ["write", "read"],
        "transfer_size": [64, 4096],
        "verify_data": true
    }"#;

    #[test]
    fn cross_product_is_numbered_from_one() {
        let series: TestSeries = SERIES.parse().unwrap();
        // send: 2 waits * 2 caps * 2 sizes, rma adds a factor of 2 ops
        assert_eq!(series.len(), 8 + 16);
        let indices: Vec<u32> = series.tests().iter().map(|t| t.test_index).collect();
        assert_eq!(indices, (1..=24).collect::<Vec<_>>());
        let first = &series.tests()[0];
        assert_eq!(first.prov_name(), Some("udp"));
        assert_eq!(first.class_function, ClassFunction::Send);
        assert_eq!(first.rma_op, None);
        assert!(first.verify_data);
    }

    #[test]
    fn rma_cases_request_rma_caps() {
        let series: TestSeries = SERIES.parse().unwrap();
        for test in series.tests().iter().filter(|t| t.class_function == ClassFunction::Rma) {
            assert!(test.caps().contains(Caps::RMA));
            assert!(test.rma_op.is_some());
        }
    }

    #[test]
    fn list_of_sets_continues_numbering() {
        let text = r#"[{"transfer_size": [1, 2]}, {"test_type": ["bandwidth"]}]"#;
        let series: TestSeries = text.parse().unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series.tests()[2].test_index, 3);
        assert_eq!(series.tests()[2].test_type, TestType::Bandwidth);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let series: TestSeries = SERIES.parse().unwrap();
        let picked: Vec<u32> = series.range(3, 5).iter().map(|t| t.test_index).collect();
        assert_eq!(picked, vec![3, 4, 5]);
        assert_eq!(series.range(0, 0).len(), 24);
    }

    #[test]
    fn unknown_names_are_config_errors() {
        assert!(matches!(parse_caps(&["bogus".to_string()]), Err(FabtestError::Config(_))));
        assert_eq!(parse_mode(&["msg_prefix".to_string()]).unwrap(), Mode::MSG_PREFIX);
        assert!("{\"cq_wait\": [\"poll\"]}".parse::<TestSeries>().is_err());
    }
}
