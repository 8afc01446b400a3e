/// Prescription lifecycle keys as stored and exchanged over the API
pub const IN_PROGRESS_KEY: &str = "IN_PROGRESS";
pub const DONE_KEY: &str = "DONE";
pub const CANCELLED_KEY: &str = "CANCELLED";

// Bucket granularity names accepted by the statistics endpoints
pub const BIN_DAYS: &str = "DAYS";
pub const BIN_MONTHS: &str = "MONTHS";
pub const BIN_YEARS: &str = "YEARS";

/// Longest statistics range accepted, in days (about a century)
pub const MAX_RANGE_DAYS: i64 = 36_600;

// Column limits carried over from the relational schema
pub const PHARMACY_NAME_MAX: usize = 128;
pub const PHARMACY_ADDRESS_MAX: usize = 256;
pub const PHARMACY_PHONE_MAX: usize = 12;
pub const PRESCRIPTION_NAME_MAX: usize = 20;
pub const DRUG_KEY_MAX: usize = 50;
pub const DRUG_RATE_MAX: f64 = 10.0;

/// Price assigned to drugs created through the bulk "create by name" action
pub const BULK_CREATED_DRUG_PRICE: f64 = 1.0;

/// Price range used for imported drugs that carry no price
pub const IMPORT_PRICE_MIN: u32 = 50_000;
pub const IMPORT_PRICE_MAX: u32 = 1_000_000;

/// Categories inserted by `seed-categories` on an empty catalog
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "anesthetics",
    "pain relief and palliative care",
    "antiallergics and anaphylaxis",
    "antidotes and other detoxifying agents",
    "anticonvulsants",
    "anti-infectives",
    "antimigraine",
    "antineoplastics and immunosuppressives",
    "antiparkinsonism",
    "medicines affecting the blood",
    "blood products and plasma substitutes",
    "cardiovascular",
    "dermatological",
    "disinfectants and antiseptics",
    "diuretics",
    "gastrointestinal",
    "hormones, endocrine and contraceptives",
    "muscle relaxants",
    "ophthalmological",
    "other",
];
