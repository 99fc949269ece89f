//! Warehouse catalog: schemas, table DDL and the SQL the pipeline runs.
//!
//! Everything here is the portable SQL subset the shipped warehouse
//! accepts. Analysis statements use a `{table}` token for the output table
//! and `:month` / `:year` bind parameters for the period.

/// Schemas the pipeline writes to.
pub const SCHEMAS: [&str; 3] = ["immigration", "temperature", "outputs"];

/// Immigration fact table.
pub const US_ENTRIES: &str = "immigration.us_entries";

/// Raw temperature fact table.
pub const TEMPERATURE_FACT: &str = "temperature.full_temperature_data";

/// Temperature aggregate derived from the fact table.
pub const TEMP_SUMMARY: &str = "temperature.temp_summary";

/// Schema holding the period analyses.
pub const OUTPUT_SCHEMA: &str = "outputs";

/// Schema holding the code dimensions.
pub const DIMENSION_SCHEMA: &str = "immigration";

/// Code dimension tables, in load order.
pub const DIMENSION_TABLES: [&str; 5] = [
    "country_codes",
    "port_codes",
    "entry_channel_codes",
    "state_codes",
    "trip_reason_codes",
];

/// Tables the default quality gate inspects.
pub const QUALITY_TABLES: [&str; 8] = [
    "immigration.us_entries",
    "immigration.country_codes",
    "immigration.port_codes",
    "immigration.entry_channel_codes",
    "immigration.state_codes",
    "immigration.trip_reason_codes",
    "temperature.full_temperature_data",
    "temperature.temp_summary",
];

/// Table DDL, safe to run repeatedly.
pub const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS immigration.us_entries (
    admnum BIGINT NOT NULL,
    i94bir DOUBLE PRECISION,
    gender VARCHAR(1),
    i94visa VARCHAR,
    i94cit VARCHAR,
    i94res VARCHAR,
    i94addr VARCHAR,
    i94mode VARCHAR,
    arrival_day BIGINT,
    arrival_month BIGINT,
    arrival_year BIGINT,
    departure_day BIGINT,
    departure_month BIGINT,
    departure_year BIGINT,
    length_of_stay BIGINT
);
CREATE INDEX IF NOT EXISTS immigration.us_entries_arrival
    ON us_entries (arrival_year, arrival_month);
CREATE INDEX IF NOT EXISTS immigration.us_entries_admnum
    ON us_entries (admnum);
CREATE TABLE IF NOT EXISTS immigration.country_codes (
    code VARCHAR,
    country_name VARCHAR
);
CREATE TABLE IF NOT EXISTS immigration.port_codes (
    code VARCHAR,
    port_name VARCHAR
);
CREATE TABLE IF NOT EXISTS immigration.entry_channel_codes (
    code VARCHAR,
    entry_channel VARCHAR
);
CREATE TABLE IF NOT EXISTS immigration.state_codes (
    code VARCHAR,
    state_name VARCHAR
);
CREATE TABLE IF NOT EXISTS immigration.trip_reason_codes (
    code VARCHAR,
    trip_reason VARCHAR
);
CREATE TABLE IF NOT EXISTS temperature.full_temperature_data (
    dt VARCHAR,
    averagetemperature DOUBLE PRECISION,
    averagetemperatureuncertainty DOUBLE PRECISION,
    city VARCHAR,
    country VARCHAR,
    latitude VARCHAR,
    longitude VARCHAR
);
CREATE INDEX IF NOT EXISTS temperature.full_temperature_data_country
    ON full_temperature_data (country);
";

/// Full recompute of the temperature summary (population standard deviation).
pub const TEMPERATURE_SUMMARY: &str = "
DROP TABLE IF EXISTS temperature.temp_summary;
CREATE TABLE temperature.temp_summary AS
    SELECT UPPER(country) AS country_name,
           AVG(averagetemperature) AS mean_temp,
           SQRT(AVG(averagetemperature * averagetemperature)
                - AVG(averagetemperature) * AVG(averagetemperature)) AS stddev_temp
    FROM temperature.full_temperature_data
    GROUP BY country;
";

/// Average age per entry channel and gender.
pub const DEMOGRAPHICS_BY_CHANNEL: &str = "
CREATE TABLE {table} AS
    SELECT codes.entry_channel, data.gender, data.average_age
    FROM (
        SELECT i94mode AS code, gender, AVG(i94bir) AS average_age
        FROM immigration.us_entries
        WHERE arrival_month = :month AND arrival_year = :year
          AND i94bir > 0 AND i94mode IS NOT NULL
        GROUP BY i94mode, gender
    ) AS data
    LEFT JOIN immigration.entry_channel_codes AS codes ON codes.code = data.code
";

/// Average length of stay per country of residence.
pub const LENGTH_OF_STAY: &str = "
CREATE TABLE {table} AS
    SELECT codes.country_name, data.average_stay
    FROM (
        SELECT i94res AS code, AVG(length_of_stay) AS average_stay
        FROM immigration.us_entries
        WHERE arrival_month = :month AND arrival_year = :year
          AND length_of_stay >= 0
        GROUP BY i94res
    ) AS data
    LEFT JOIN immigration.country_codes AS codes ON codes.code = data.code
";

/// Entry counts per destination state and trip reason.
pub const STATE_TRIP_REASONS: &str = "
CREATE TABLE {table} AS
    SELECT sc.state_name, tr.trip_reason, data.count
    FROM (
        SELECT i94addr AS state_code, i94visa AS trip_reason_code, COUNT(*) AS count
        FROM immigration.us_entries
        WHERE arrival_month = :month AND arrival_year = :year
          AND i94visa IS NOT NULL
        GROUP BY i94addr, i94visa
    ) AS data
    LEFT JOIN immigration.state_codes AS sc ON sc.code = data.state_code
    LEFT JOIN immigration.trip_reason_codes AS tr ON tr.code = data.trip_reason_code
";

/// Visitor counts per residence country next to its temperature summary.
pub const FREQS_AND_MEAN_TEMPS: &str = "
CREATE TABLE {table} AS
    SELECT codes.country_name, data.visitor_count, temps.mean_temp, temps.stddev_temp
    FROM immigration.country_codes AS codes
    JOIN (
        SELECT i94res AS code, COUNT(*) AS visitor_count
        FROM immigration.us_entries
        WHERE arrival_month = :month AND arrival_year = :year
        GROUP BY i94res
    ) AS data ON codes.code = data.code
    JOIN temperature.temp_summary AS temps ON codes.country_name = temps.country_name
";

/// Built-in period analyses as `(name, statement)` pairs.
pub const ANALYSES: [(&str, &str); 4] = [
    ("demographics_by_channel", DEMOGRAPHICS_BY_CHANNEL),
    ("length_of_stay", LENGTH_OF_STAY),
    ("state_trip_reasons", STATE_TRIP_REASONS),
    ("freqs_and_mean_temps", FREQS_AND_MEAN_TEMPS),
];

/// Default quality check query.
pub const ROW_COUNT_QUERY: &str = "SELECT COUNT(*) FROM {table}";

/// Returns `schema.table` for a dimension.
#[must_use]
pub fn dimension_table(name: &str) -> String {
    format!("{DIMENSION_SCHEMA}.{name}")
}
