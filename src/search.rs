#[cfg(test)]
use std::cmp::Ordering;
use std::num::IntErrorKind;

use serde::Serialize;

#[cfg(test)]
use crate::models::Department;

/// Allow-lists and page sizes for department listings.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub sort_options: Vec<SortOption>,
    pub default_sort: SortKey,
    pub limit_amounts: Vec<usize>,
    pub default_page_size: usize,
    pub search_fields: Vec<String>,
    pub range_fields: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let sort_options = [
            ("name", "Name Ascending"),
            ("-name", "Name Descending"),
            ("state", "State Ascending"),
            ("-state", "State Descending"),
            ("dist_model_score", "Lowest DIST Score"),
            ("-dist_model_score", "Highest DIST Score"),
            ("population", "Smallest Population"),
            ("-population", "Largest Population"),
        ]
        .into_iter()
        .map(|(field, label)| SortOption {
            field: field.to_string(),
            label: label.to_string(),
        })
        .collect();

        Self {
            sort_options,
            default_sort: SortKey {
                field: SortField::Population,
                descending: true,
            },
            limit_amounts: vec![15, 30, 60, 90],
            default_page_size: 30,
            search_fields: ["fdid", "state", "region", "name"]
                .into_iter()
                .map(String::from)
                .collect(),
            range_fields: ["population", "dist_model_score"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortOption {
    pub field: String,
    #[serde(rename = "name")]
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    State,
    DistModelScore,
    Population,
}

impl SortField {
    pub fn column(self) -> &'static str {
        match self {
            SortField::Name => "name",
            SortField::State => "state",
            SortField::DistModelScore => "dist_model_score",
            SortField::Population => "population",
        }
    }

    fn parse(column: &str) -> Option<Self> {
        match column {
            "name" => Some(SortField::Name),
            "state" => Some(SortField::State),
            "dist_model_score" => Some(SortField::DistModelScore),
            "population" => Some(SortField::Population),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub descending: bool,
}

impl SortKey {
    pub fn parse(raw: &str) -> Option<Self> {
        let (descending, column) = match raw.strip_prefix('-') {
            Some(column) => (true, column),
            None => (false, raw),
        };
        SortField::parse(column).map(|field| SortKey { field, descending })
    }

    /// The `sortBy` value selecting this key.
    pub fn to_param(&self) -> String {
        if self.descending {
            format!("-{}", self.field.column())
        } else {
            self.field.column().to_string()
        }
    }

    /// Nulls go last when sorting by population, whatever the direction.
    /// Other columns keep the database default of nulls-last ascending and
    /// nulls-first descending.
    pub fn nulls_last(&self) -> bool {
        self.field == SortField::Population || !self.descending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Fdid,
    State,
    Region,
    Name,
}

impl TextField {
    pub fn column(self) -> &'static str {
        match self {
            TextField::Fdid => "fdid",
            TextField::State => "state",
            TextField::Region => "region",
            TextField::Name => "name",
        }
    }

    fn parse(column: &str) -> Option<Self> {
        match column {
            "fdid" => Some(TextField::Fdid),
            "state" => Some(TextField::State),
            "region" => Some(TextField::Region),
            "name" => Some(TextField::Name),
            _ => None,
        }
    }

    #[cfg(test)]
    fn value(self, department: &Department) -> Option<&str> {
        match self {
            TextField::Fdid => department.fdid.as_deref(),
            TextField::State => department.state.as_deref(),
            TextField::Region => department.region.as_deref(),
            TextField::Name => Some(department.name.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeField {
    Population,
    DistModelScore,
}

impl RangeField {
    pub fn column(self) -> &'static str {
        match self {
            RangeField::Population => "population",
            RangeField::DistModelScore => "dist_model_score",
        }
    }

    fn parse(column: &str) -> Option<Self> {
        match column {
            "population" => Some(RangeField::Population),
            "dist_model_score" => Some(RangeField::DistModelScore),
            _ => None,
        }
    }

    #[cfg(test)]
    fn value(self, department: &Department) -> Option<f64> {
        match self {
            RangeField::Population => department.population.map(|p| p as f64),
            RangeField::DistModelScore => department.dist_model_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    Exact { field: TextField, value: String },
    Contains { field: TextField, value: String },
    Range {
        field: RangeField,
        min: Option<i64>,
        max: Option<i64>,
    },
}

#[cfg(test)]
impl FieldFilter {
    pub fn matches(&self, department: &Department) -> bool {
        match self {
            FieldFilter::Exact { field, value } => field.value(department) == Some(value.as_str()),
            FieldFilter::Contains { field, value } => field
                .value(department)
                .is_some_and(|candidate| candidate.to_lowercase().contains(&value.to_lowercase())),
            FieldFilter::Range { field, min, max } => {
                let value = field.value(department);
                let above_min = match min {
                    Some(min) => value.is_some_and(|v| v >= *min as f64),
                    None => true,
                };
                let below_max = match max {
                    Some(max) => value.map_or(true, |v| v <= *max as f64),
                    None => true,
                };
                above_min && below_max
            }
        }
    }
}

/// Parses a `min,max` range. Empty or zero bounds are open; anything that
/// fails to parse drops the whole range.
pub fn parse_range(raw: &str) -> Option<(Option<i64>, Option<i64>)> {
    let (min, max) = raw.split_once(',')?;
    if max.contains(',') {
        return None;
    }
    let bound = |part: &str| -> Result<Option<i64>, std::num::ParseIntError> {
        let part = part.trim();
        if part.is_empty() {
            return Ok(None);
        }
        let value: i64 = part.parse()?;
        Ok((value != 0).then_some(value))
    };
    let min = bound(min).ok()?;
    let max = bound(max).ok()?;
    Some((min, max))
}

/// Validated listing request: a free-text query or field filters, plus a
/// sort that is always set.
#[derive(Debug, Clone, PartialEq)]
pub struct DepartmentQuery {
    pub text: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub sort: SortKey,
}

impl DepartmentQuery {
    pub fn from_params(params: &[(String, String)], config: &SearchConfig) -> Self {
        let text = param(params, "q")
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string);

        let sort = param(params, "sortBy")
            .filter(|raw| config.sort_options.iter().any(|option| option.field == *raw))
            .and_then(SortKey::parse)
            .unwrap_or(config.default_sort);

        let mut filters = Vec::new();
        if text.is_none() {
            for (field, value) in params {
                if value.is_empty() {
                    continue;
                }
                if config.search_fields.contains(field) && !value.eq_ignore_ascii_case("any") {
                    if let Some(text_field) = TextField::parse(field) {
                        filters.push(if field.to_lowercase().ends_with("name") {
                            FieldFilter::Contains {
                                field: text_field,
                                value: value.clone(),
                            }
                        } else {
                            FieldFilter::Exact {
                                field: text_field,
                                value: value.clone(),
                            }
                        });
                    }
                }
                if config.range_fields.contains(field) {
                    let range = RangeField::parse(field).zip(parse_range(value));
                    if let Some((range_field, (min, max))) = range {
                        if min.is_some() || max.is_some() {
                            filters.push(FieldFilter::Range {
                                field: range_field,
                                min,
                                max,
                            });
                        }
                    }
                }
            }
        }

        DepartmentQuery {
            text,
            filters,
            sort,
        }
    }
}

/// In-memory evaluation of a query, mirroring the SQL listing.
#[cfg(test)]
impl DepartmentQuery {
    pub fn matches(&self, department: &Department) -> bool {
        match &self.text {
            Some(text) => matches_text(department, text),
            None => self.filters.iter().all(|filter| filter.matches(department)),
        }
    }

    pub fn compare(&self, a: &Department, b: &Department) -> Ordering {
        let ordering = match self.sort.field {
            SortField::Name => compare_nullable(Some(&a.name), Some(&b.name), self.sort),
            SortField::State => compare_nullable(a.state.as_ref(), b.state.as_ref(), self.sort),
            SortField::DistModelScore => compare_nullable(
                a.dist_model_score.map(OrderedScore).as_ref(),
                b.dist_model_score.map(OrderedScore).as_ref(),
                self.sort,
            ),
            SortField::Population => {
                compare_nullable(a.population.as_ref(), b.population.as_ref(), self.sort)
            }
        };
        ordering.then(a.id.cmp(&b.id))
    }

    /// Filters and orders an in-memory collection.
    pub fn apply(&self, departments: Vec<Department>) -> Vec<Department> {
        let mut matched: Vec<Department> = departments
            .into_iter()
            .filter(|department| self.matches(department))
            .collect();
        matched.sort_by(|a, b| self.compare(a, b));
        matched
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedScore(f64);

#[cfg(test)]
impl Eq for OrderedScore {}

#[cfg(test)]
impl PartialOrd for OrderedScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
impl Ord for OrderedScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Orders two nullable values by `sort`. Non-null values follow the sort
/// direction; nulls are placed per `SortKey::nulls_last`.
#[cfg(test)]
fn compare_nullable<T: Ord>(a: Option<&T>, b: Option<&T>, sort: SortKey) -> Ordering {
    let null_order = if sort.nulls_last() {
        Ordering::Greater
    } else {
        Ordering::Less
    };
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => null_order,
        (Some(_), None) => null_order.reverse(),
        (Some(a), Some(b)) if sort.descending => b.cmp(a),
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// Every query term has to equal a term of the department's search vector.
#[cfg(test)]
fn matches_text(department: &Department, text: &str) -> bool {
    let vector: Vec<String> = [
        Some(department.name.as_str()),
        department.fdid.as_deref(),
        department.state.as_deref(),
        department.region.as_deref(),
    ]
    .into_iter()
    .flatten()
    .flat_map(search_terms)
    .collect();

    let terms = search_terms(text);
    !terms.is_empty() && terms.iter().all(|term| vector.contains(term))
}

#[cfg(test)]
fn search_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
        .collect()
}

pub fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

/// Page size from `limit`, honoured only for allow-listed amounts.
pub fn resolve_page_size(raw: Option<&str>, config: &SearchConfig) -> usize {
    raw.and_then(|limit| limit.trim().parse::<usize>().ok())
        .filter(|limit| *limit != 0 && config.limit_amounts.contains(limit))
        .unwrap_or(config.default_page_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageBounds {
    pub number: usize,
    pub num_pages: usize,
    pub count: usize,
    pub page_size: usize,
}

impl PageBounds {
    /// Resolves the requested page, clamping into `1..=num_pages`. A page
    /// number too large for an integer selects the last page; any other
    /// non-integer selects the first.
    pub fn resolve(raw: Option<&str>, count: usize, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let num_pages = count.div_ceil(page_size).max(1);
        let number = match raw.map(|page| page.trim().parse::<i64>()) {
            Some(Ok(page)) if page < 1 => 1,
            Some(Ok(page)) => usize::try_from(page).unwrap_or(usize::MAX).min(num_pages),
            Some(Err(err)) if *err.kind() == IntErrorKind::PosOverflow => num_pages,
            Some(Err(_)) | None => 1,
        };
        PageBounds {
            number,
            num_pages,
            count,
            page_size,
        }
    }

    pub fn offset(&self) -> usize {
        (self.number - 1) * self.page_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageWindow {
    pub pages: Vec<usize>,
    pub first_page: Option<usize>,
    pub last_page: Option<usize>,
}

/// Pages within five of the current one, with shortcuts to the ends that the
/// window leaves out.
pub fn page_window(bounds: &PageBounds) -> PageWindow {
    let min_page = bounds.number.saturating_sub(5).max(1);
    let max_page = (bounds.number + 5).min(bounds.num_pages);
    PageWindow {
        pages: (min_page..=max_page).collect(),
        first_page: (min_page > 1).then_some(1),
        last_page: (max_page < bounds.num_pages).then_some(bounds.num_pages),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitLink {
    pub url: String,
    pub limit: usize,
}

/// One link per allowed page size, keeping the other query parameters.
pub fn limit_links(path: &str, params: &[(String, String)], config: &SearchConfig) -> Vec<LimitLink> {
    config
        .limit_amounts
        .iter()
        .map(|limit| {
            let mut query: Vec<(String, String)> = params
                .iter()
                .filter(|(name, _)| name != "limit")
                .cloned()
                .collect();
            query.push(("limit".to_string(), limit.to_string()));
            let encoded = serde_urlencoded::to_string(&query).unwrap_or_default();
            LimitLink {
                url: format!("{path}?{encoded}"),
                limit: *limit,
            }
        })
        .collect()
}
