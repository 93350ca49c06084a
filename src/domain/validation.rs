//! 预检/后检结果模型

use serde::{Deserialize, Serialize};

/// 检查结论
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Passed,
    Warning,
    Failed,
}

/// 单项检查
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    pub category: String,
    pub name: String,
    pub status: ValidationStatus,
    pub message: String,
}

impl CheckResult {
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        status: ValidationStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            status,
            message: message.into(),
        }
    }

    pub fn passed(category: &str, name: &str, message: impl Into<String>) -> Self {
        Self::new(category, name, ValidationStatus::Passed, message)
    }

    pub fn warning(category: &str, name: &str, message: impl Into<String>) -> Self {
        Self::new(category, name, ValidationStatus::Warning, message)
    }

    pub fn failed(category: &str, name: &str, message: impl Into<String>) -> Self {
        Self::new(category, name, ValidationStatus::Failed, message)
    }
}

/// 按类别聚合的检查结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CategoryResult {
    pub category: String,
    pub checks: Vec<CheckResult>,
}

impl CategoryResult {
    /// 类别结论取最差的单项
    pub fn status(&self) -> ValidationStatus {
        self.checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(ValidationStatus::Passed)
    }
}

/// 综合校验报告
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationReport {
    pub overall_status: ValidationStatus,
    pub categories: Vec<CategoryResult>,
}

impl ValidationReport {
    /// 由类别结果汇总整体结论
    pub fn from_categories(categories: Vec<CategoryResult>) -> Self {
        let overall_status = categories
            .iter()
            .map(|c| c.status())
            .max()
            .unwrap_or(ValidationStatus::Passed);
        Self {
            overall_status,
            categories,
        }
    }

    pub fn failed_checks(&self) -> Vec<CheckResult> {
        self.checks_with(ValidationStatus::Failed)
    }

    pub fn warnings(&self) -> Vec<CheckResult> {
        self.checks_with(ValidationStatus::Warning)
    }

    fn checks_with(&self, status: ValidationStatus) -> Vec<CheckResult> {
        self.categories
            .iter()
            .flat_map(|c| c.checks.iter())
            .filter(|c| c.status == status)
            .cloned()
            .collect()
    }
}
