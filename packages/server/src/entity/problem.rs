use sea_orm::entity::prelude::*;
use sea_orm::prelude::StringLen;
use serde::{Deserialize, Serialize};

/// Whether testcase-level events are published for a problem's submissions
/// (§4.5: "Testcase events for a submission whose problem has a non-ALL
/// testcase-visibility policy are suppressed entirely").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestcaseVisibility {
    #[sea_orm(string_value = "ALL")]
    All,
    #[sea_orm(string_value = "HIDDEN")]
    Hidden,
}

/// A single language's time/memory override, keyed by language id in
/// [`Model::language_overrides`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LanguageOverride {
    pub time_limit: Option<f64>,
    pub memory_limit: Option<i64>,
}

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "problem")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Worker-facing problem code, matched against a worker's reported problem set.
    pub code: String,
    pub title: String,

    /// Default time limit in seconds.
    pub time_limit: f64,
    /// Default memory limit in kilobytes.
    pub memory_limit: i64,

    /// Full achievable score for this problem.
    pub points: f64,
    /// Whether partial credit is awarded; if false, any score below full is clamped to 0.
    pub partial: bool,

    pub testcase_visibility: TestcaseVisibility,

    /// `{ "language-id": { "time_limit": f64, "memory_limit": i64 } }`.
    #[sea_orm(column_type = "JsonBinary")]
    pub language_overrides: serde_json::Value,

    #[sea_orm(has_many)]
    pub submissions: HasMany<super::submission::Entity>,

    pub created_at: DateTimeUtc,
}

impl Model {
    /// Resolve the effective time/memory limits for `language`, applying any
    /// per-language override over the problem default.
    pub fn limits_for(&self, language: &str) -> (f64, i64) {
        let overrides: std::collections::HashMap<String, LanguageOverride> =
            serde_json::from_value(self.language_overrides.clone()).unwrap_or_default();
        match overrides.get(language) {
            Some(o) => (
                o.time_limit.unwrap_or(self.time_limit),
                o.memory_limit.unwrap_or(self.memory_limit),
            ),
            None => (self.time_limit, self.memory_limit),
        }
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_for_falls_back_to_default() {
        let model = Model {
            id: 1,
            code: "p1".into(),
            title: "Problem".into(),
            time_limit: 2.0,
            memory_limit: 262144,
            points: 100.0,
            partial: true,
            testcase_visibility: TestcaseVisibility::All,
            language_overrides: serde_json::json!({
                "java": { "time_limit": 4.0, "memory_limit": null }
            }),
            created_at: chrono::Utc::now(),
        };

        assert_eq!(model.limits_for("py3"), (2.0, 262144));
        assert_eq!(model.limits_for("java"), (4.0, 262144));
    }
}
