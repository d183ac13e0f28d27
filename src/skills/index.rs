//! 技能候选检索：用嵌入向量为路由预筛 Top-K 技能
//!
//! 未启用、尚未建好索引、技能数不超过 K、或嵌入调用失败时，退回完整技能列表。
//! 兜底技能总是出现在候选中。

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::llm::EmbeddingProvider;
use crate::skills::catalog::SkillCatalog;
use crate::skills::loader::SkillDefinition;

pub struct SkillIndex {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    top_k: usize,
    /// (技能名, 向量)，与目录顺序一致
    vectors: RwLock<Option<Vec<(String, Vec<f32>)>>>,
}

impl SkillIndex {
    pub fn new(embedder: Option<Arc<dyn EmbeddingProvider>>, top_k: usize) -> Self {
        Self {
            embedder,
            top_k: top_k.max(1),
            vectors: RwLock::new(None),
        }
    }

    /// 不做检索，始终返回完整列表
    pub fn disabled() -> Self {
        Self::new(None, usize::MAX)
    }

    pub async fn is_ready(&self) -> bool {
        self.vectors.read().await.is_some()
    }

    /// 为目录中每个技能计算 `name: description` 的向量；失败时保持未就绪
    pub async fn build(&self, catalog: &SkillCatalog) {
        let Some(embedder) = &self.embedder else {
            return;
        };
        let texts: Vec<String> = catalog.all().iter().map(SkillDefinition::summary).collect();
        match embedder.embed(&texts).await {
            Ok(vecs) => {
                let entries = catalog.names().into_iter().zip(vecs).collect::<Vec<_>>();
                tracing::info!(skills = entries.len(), "[Skills] 技能向量索引已构建");
                *self.vectors.write().await = Some(entries);
            }
            Err(e) => {
                tracing::warn!(error = %e, "[Skills] 技能向量索引构建失败，使用完整技能列表");
            }
        }
    }

    /// 返回候选技能（按相似度降序，兜底技能追加在末尾）
    pub async fn candidates(&self, query: &str, catalog: &SkillCatalog) -> Vec<SkillDefinition> {
        let full = || catalog.all().to_vec();
        if catalog.len() <= self.top_k {
            return full();
        }
        let Some(embedder) = &self.embedder else {
            return full();
        };
        let guard = self.vectors.read().await;
        let Some(vectors) = guard.as_ref() else {
            return full();
        };

        let query_vec = match embedder.embed(&[query.to_string()]).await {
            Ok(mut v) if !v.is_empty() => v.swap_remove(0),
            Ok(_) => return full(),
            Err(e) => {
                tracing::warn!(error = %e, "[Skills] 查询向量化失败，使用完整技能列表");
                return full();
            }
        };

        let mut scored: Vec<(&str, f32)> = vectors
            .iter()
            .map(|(name, v)| (name.as_str(), cosine_similarity(&query_vec, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut out: Vec<SkillDefinition> = scored
            .iter()
            .take(self.top_k)
            .filter_map(|(name, _)| catalog.get(name).cloned())
            .collect();
        if let Some(fallback) = catalog.fallback() {
            if !out.iter().any(|s| s.name == fallback.name) {
                out.push(fallback.clone());
            }
        }
        tracing::debug!(
            candidates = ?out.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "[Skills] 候选技能"
        );
        out
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
