//! 营养领域内置工具
//!
//! - `nutrient_lookup`：内置每 100g 营养成分表，按份量换算
//! - `lookup_profile`：读取用户长期记忆（体重、目标、饮食偏好等）

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::memory::MemoryStore;
use crate::tools::{FieldType, InputSchema, Tool};

/// (名称, kcal, 蛋白质 g, 碳水 g, 脂肪 g, 膳食纤维 g)，每 100g
const NUTRIENT_TABLE: &[(&str, f64, f64, f64, f64, f64)] = &[
    ("almonds", 579.0, 21.2, 21.6, 49.9, 12.5),
    ("banana", 89.0, 1.1, 22.8, 0.3, 2.6),
    ("broccoli", 34.0, 2.8, 6.6, 0.4, 2.6),
    ("brown rice", 112.0, 2.3, 23.5, 0.8, 1.8),
    ("chicken breast", 165.0, 31.0, 0.0, 3.6, 0.0),
    ("egg", 155.0, 13.0, 1.1, 11.0, 0.0),
    ("greek yogurt", 59.0, 10.2, 3.6, 0.4, 0.0),
    ("lentils", 116.0, 9.0, 20.1, 0.4, 7.9),
    ("oats", 389.0, 16.9, 66.3, 6.9, 10.6),
    ("salmon", 208.0, 20.4, 0.0, 13.4, 0.0),
    ("sweet potato", 86.0, 1.6, 20.1, 0.1, 3.0),
    ("tofu", 76.0, 8.0, 1.9, 4.8, 0.3),
];

/// 营养成分查询
#[derive(Debug, Default)]
pub struct NutrientLookupTool;

impl NutrientLookupTool {
    fn find(food: &str) -> Option<&'static (&'static str, f64, f64, f64, f64, f64)> {
        let needle = food.trim().to_lowercase();
        NUTRIENT_TABLE
            .iter()
            .find(|row| row.0 == needle)
            .or_else(|| NUTRIENT_TABLE.iter().find(|row| needle.contains(row.0)))
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[async_trait]
impl Tool for NutrientLookupTool {
    fn name(&self) -> &str {
        "nutrient_lookup"
    }

    fn description(&self) -> &str {
        "Look up calories and macronutrients for a food. Returns values for the requested portion (default 100 g)."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new()
            .required("food", FieldType::String, "food name, e.g. \"oats\"")
            .optional("grams", FieldType::Number, "portion size in grams (default 100)")
    }

    fn timeout_ms(&self) -> Option<u64> {
        Some(1_000)
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let food = args
            .get("food")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing food".to_string())?;
        let grams = args.get("grams").and_then(|v| v.as_f64()).unwrap_or(100.0);
        if grams <= 0.0 {
            return Err(format!("portion must be positive, got {}", grams));
        }
        let (name, kcal, protein, carbs, fat, fiber) =
            *Self::find(food).ok_or_else(|| format!("no nutrient data for '{}'", food))?;
        let f = grams / 100.0;
        Ok(json!({
            "food": name,
            "grams": grams,
            "kcal": round1(kcal * f),
            "protein_g": round1(protein * f),
            "carbs_g": round1(carbs * f),
            "fat_g": round1(fat * f),
            "fiber_g": round1(fiber * f),
        }))
    }
}

/// 用户档案查询：返回该用户全部长期记忆记录
pub struct ProfileLookupTool {
    memory: Arc<dyn MemoryStore>,
}

impl ProfileLookupTool {
    pub fn new(memory: Arc<dyn MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for ProfileLookupTool {
    fn name(&self) -> &str {
        "lookup_profile"
    }

    fn description(&self) -> &str {
        "Fetch the stored long-term profile (weight, goals, dietary preferences) for a user."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new().required("user_id", FieldType::String, "user id from the Session section")
    }

    fn timeout_ms(&self) -> Option<u64> {
        Some(2_000)
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let user_id = args
            .get("user_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing user_id".to_string())?;
        let records = self.memory.get_long_term(user_id).await;
        let profile: Map<String, Value> = records
            .into_iter()
            .map(|r| (r.key, Value::String(r.value)))
            .collect();
        Ok(json!({ "user_id": user_id, "profile": profile }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStore, RecordScope};

    #[tokio::test]
    async fn test_nutrient_lookup_scales_portion() {
        let out = NutrientLookupTool
            .execute(json!({"food": "Chicken Breast", "grams": 200}))
            .await
            .unwrap();
        assert_eq!(out["food"], "chicken breast");
        assert_eq!(out["protein_g"], 62.0);
        assert_eq!(out["kcal"], 330.0);
    }

    #[tokio::test]
    async fn test_nutrient_lookup_unknown_food() {
        let err = NutrientLookupTool
            .execute(json!({"food": "dragon fruit"}))
            .await
            .unwrap_err();
        assert!(err.contains("dragon fruit"));
    }

    #[tokio::test]
    async fn test_profile_lookup_reads_long_term_records() {
        let store = Arc::new(InMemoryStore::new());
        store
            .set_record(RecordScope::User("u1".into()), "weight_kg", "70")
            .await
            .unwrap();
        let tool = ProfileLookupTool::new(store);
        let out = tool.execute(json!({"user_id": "u1"})).await.unwrap();
        assert_eq!(out["profile"]["weight_kg"], "70");
    }
}
