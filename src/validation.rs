use base64::Engine;

use crate::account::{generation_cost, Balance};
use crate::error::GenerationError;
use crate::models::{GenerationMode, GenerationPayload};

/// Checks the form for `mode` and the balance for its cost. Purely local.
pub fn validate_submission(
    mode: GenerationMode,
    payload: &GenerationPayload,
    balance: &Balance,
) -> Result<u32, GenerationError> {
    validate_form(mode, payload)?;
    let cost = generation_cost(mode, payload.generate_variations);
    if !balance.can_afford(cost) {
        return Err(GenerationError::InsufficientBalance {
            cost,
            coins: balance.coins,
        });
    }
    Ok(cost)
}

pub fn validate_form(mode: GenerationMode, payload: &GenerationPayload) -> Result<(), GenerationError> {
    match mode {
        GenerationMode::Labels => {
            let has_text = payload
                .label_text
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty());
            if !has_text {
                return Err(GenerationError::Validation(
                    "Please enter the label text.".into(),
                ));
            }
        }
        GenerationMode::UiElements => {
            if !payload.has_reference_image() {
                return Err(GenerationError::Validation(
                    "Please upload a reference image.".into(),
                ));
            }
        }
        GenerationMode::Icons | GenerationMode::Illustrations | GenerationMode::Mockups => {
            if !payload.has_description() && !payload.has_reference_image() {
                return Err(GenerationError::Validation(
                    "Please enter a description or upload a reference image.".into(),
                ));
            }
        }
    }

    if let Some(image) = payload.reference_image.as_deref() {
        if !image.trim().is_empty() {
            decode_reference_image(image)?;
        }
    }
    if payload.icon_count == Some(0) {
        return Err(GenerationError::Validation(
            "Please request at least one item.".into(),
        ));
    }
    Ok(())
}

/// Accepts raw base64 or a `data:<mime>;base64,` URL.
fn decode_reference_image(image: &str) -> Result<Vec<u8>, GenerationError> {
    let encoded = match image.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => image,
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| GenerationError::Validation("The reference image could not be read.".into()))
}
