//! Domain documents and their wire representations.
//!
//! Stored documents ([`User`], [`Beer`], [`Brewery`], [`Comment`]) are plain
//! structs. They are rendered as JSON:API resources through [`JsonApi`].
//!
//! Request bodies are deserialized into typed inputs and checked with
//! `validator`. Every failing field is reported as a [`FieldError`], not just
//! the first one.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use validator::{Validate, ValidationError};

use crate::error::{ApiError, FieldError};

// ============================================================================
// Documents
// ============================================================================

/// A registered user. The password hash never leaves the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beer {
    pub id: String,
    pub name: String,
    pub brewery_id: String,
    pub alcohol_level: u8,
    pub picture: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Brewery {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub location: String,
}

/// A comment left by a user on a beer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub beer_id: String,
    pub user_id: String,
    pub body: String,
    pub date: DateTime<Utc>,
}

// ============================================================================
// JSON:API rendering
// ============================================================================

/// `links` member of a resource object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceLinks {
    #[serde(rename = "self")]
    pub self_link: String,
}

/// A JSON:API resource object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource<A> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub attributes: A,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<ResourceLinks>,
}

/// Top-level JSON:API document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<Resource<BreweryAttributes>>,
}

impl<T> Document<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            included: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_included(mut self, included: Vec<Resource<BreweryAttributes>>) -> Self {
        self.included = included;
        self
    }
}

/// A document type that can be rendered as a JSON:API resource.
pub trait JsonApi {
    /// Value of the resource `type` member.
    const TYPE: &'static str;

    type Attributes: Serialize;

    fn id(&self) -> &str;

    fn attributes(&self) -> Self::Attributes;

    /// Path of this resource below the route prefix, used for `self` links.
    fn path(&self) -> String {
        format!("/{}/{}", Self::TYPE, self.id())
    }

    /// Renders the resource with a `self` link rooted at `base`
    /// (base URL plus route prefix).
    fn to_resource(&self, base: &str) -> Resource<Self::Attributes> {
        Resource {
            kind: Self::TYPE,
            id: self.id().to_string(),
            attributes: self.attributes(),
            links: Some(ResourceLinks {
                self_link: format!("{base}{}", self.path()),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserAttributes {
    pub username: String,
    pub firstname: String,
    pub lastname: String,
}

impl JsonApi for User {
    const TYPE: &'static str = "user";
    type Attributes = UserAttributes;

    fn id(&self) -> &str {
        &self.id
    }

    fn attributes(&self) -> UserAttributes {
        UserAttributes {
            username: self.username.clone(),
            firstname: self.firstname.clone(),
            lastname: self.lastname.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeerAttributes {
    pub name: String,
    pub brewery_id: String,
    pub alcohol_level: u8,
    pub picture: String,
}

impl JsonApi for Beer {
    const TYPE: &'static str = "beer";
    type Attributes = BeerAttributes;

    fn id(&self) -> &str {
        &self.id
    }

    fn attributes(&self) -> BeerAttributes {
        BeerAttributes {
            name: self.name.clone(),
            brewery_id: self.brewery_id.clone(),
            alcohol_level: self.alcohol_level,
            picture: self.picture.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreweryAttributes {
    pub name: String,
    pub owner: String,
    pub location: String,
}

impl JsonApi for Brewery {
    const TYPE: &'static str = "brewery";
    type Attributes = BreweryAttributes;

    fn id(&self) -> &str {
        &self.id
    }

    fn attributes(&self) -> BreweryAttributes {
        BreweryAttributes {
            name: self.name.clone(),
            owner: self.owner.clone(),
            location: self.location.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentAttributes {
    pub body: String,
    pub date: DateTime<Utc>,
    pub user_id: String,
    pub beer_id: String,
}

impl JsonApi for Comment {
    const TYPE: &'static str = "comment";
    type Attributes = CommentAttributes;

    fn id(&self) -> &str {
        &self.id
    }

    fn attributes(&self) -> CommentAttributes {
        CommentAttributes {
            body: self.body.clone(),
            date: self.date,
            user_id: self.user_id.clone(),
            beer_id: self.beer_id.clone(),
        }
    }

    fn path(&self) -> String {
        format!("/beer/{}/comments/{}", self.beer_id, self.id)
    }
}

/// Attributes of the token returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenAttributes {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

// ============================================================================
// Field validators
// ============================================================================

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::Borrowed(message));
    err
}

/// Rejects empty and whitespace-only strings.
pub fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(invalid("blank", "can't be empty"));
    }
    Ok(())
}

fn validate_alpha(value: &str, extra: &str) -> Result<(), ValidationError> {
    validate_not_blank(value)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_alphabetic() || extra.contains(c))
    {
        return Err(invalid("alpha", "should contain only alpha characters"));
    }
    Ok(())
}

/// Letters, `-` and `_`.
pub fn validate_username(value: &str) -> Result<(), ValidationError> {
    validate_alpha(value, "-_")
}

/// Letters and `-`.
pub fn validate_firstname(value: &str) -> Result<(), ValidationError> {
    validate_alpha(value, "-")
}

/// Letters, spaces and `-`.
pub fn validate_lastname(value: &str) -> Result<(), ValidationError> {
    validate_alpha(value, " -")
}

/// A 24-character lowercase hex document id.
pub fn validate_object_id(value: &str) -> Result<(), ValidationError> {
    validate_not_blank(value)?;
    if !is_object_id(value) {
        return Err(invalid("object_id", "must be a valid id"));
    }
    Ok(())
}

/// Returns true for 24-character lowercase hex strings.
#[must_use]
pub fn is_object_id(candidate: &str) -> bool {
    candidate.len() == 24
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

const ALCOHOL_LEVEL_MSG: &str = "alcoholLevel must be numeric, and below 100";

/// Reads an explicit `null` like an absent member.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accepts a non-negative integer or a numeric string; `null` reads as absent.
fn alcohol_level<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let level = match Value::deserialize(deserializer)? {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    level
        .and_then(|level| u8::try_from(level).ok())
        .map(Some)
        .ok_or_else(|| D::Error::custom(ALCOHOL_LEVEL_MSG))
}

// ============================================================================
// Request inputs
// ============================================================================

/// `(field, wire name)` pairs in the order their errors are reported.
type Fields = &'static [(&'static str, &'static str)];

/// Deserializes a JSON object body into `T`, then runs its validators.
fn parse_body<T>(body: &Map<String, Value>, fields: Fields) -> Result<T, ApiError>
where
    T: DeserializeOwned + Validate,
{
    let input: T = serde_json::from_value(Value::Object(body.clone())).map_err(|err| {
        ApiError::field(FieldError::body(
            "body",
            Value::Object(body.clone()),
            err.to_string(),
        ))
    })?;
    input
        .validate()
        .map_err(|errors| ApiError::from_validation(&errors, body, fields))?;
    Ok(input)
}

/// Body of `POST /user`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
pub struct NewUser {
    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_username"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub username: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_firstname"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub firstname: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_lastname"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub lastname: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub password: String,
}

impl NewUser {
    const FIELDS: Fields = &[
        ("username", "username"),
        ("firstname", "firstname"),
        ("lastname", "lastname"),
        ("password", "password"),
    ];

    pub fn from_body(body: &Map<String, Value>) -> Result<Self, ApiError> {
        parse_body(body, Self::FIELDS)
    }
}

/// Body of `POST /user/login`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
pub struct Credentials {
    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub username: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub password: String,
}

impl Credentials {
    const FIELDS: Fields = &[("username", "username"), ("password", "password")];

    pub fn from_body(body: &Map<String, Value>) -> Result<Self, ApiError> {
        parse_body(body, Self::FIELDS)
    }
}

/// Body of `PATCH /user/{id}`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Validate)]
pub struct UserPatch {
    #[validate(
        custom(function = "validate_username"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub username: Option<String>,

    #[validate(
        custom(function = "validate_firstname"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub firstname: Option<String>,

    #[validate(
        custom(function = "validate_lastname"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub lastname: Option<String>,
}

impl UserPatch {
    const FIELDS: Fields = &[
        ("username", "username"),
        ("firstname", "firstname"),
        ("lastname", "lastname"),
    ];

    /// Parses a patch body. A `password` member is refused outright.
    pub fn from_body(body: &Map<String, Value>) -> Result<Self, ApiError> {
        if body.contains_key("password") {
            return Err(ApiError::Forbidden(
                "The password can't be changed by this route.".to_string(),
            ));
        }
        parse_body(body, Self::FIELDS)
    }

    pub fn apply(self, user: &mut User) {
        if let Some(username) = self.username {
            user.username = username;
        }
        if let Some(firstname) = self.firstname {
            user.firstname = firstname;
        }
        if let Some(lastname) = self.lastname {
            user.lastname = lastname;
        }
    }
}

/// Body of `POST /beer`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewBeer {
    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub name: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(custom(function = "validate_object_id"))]
    pub brewery_id: String,

    /// Always `Some` once validated.
    #[serde(default, deserialize_with = "alcohol_level")]
    #[validate(
        required(message = "must be numeric, and below 100"),
        range(max = 100, message = "must be numeric, and below 100")
    )]
    pub alcohol_level: Option<u8>,

    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub picture: String,
}

impl NewBeer {
    const FIELDS: Fields = &[
        ("name", "name"),
        ("brewery_id", "breweryId"),
        ("alcohol_level", "alcoholLevel"),
        ("picture", "picture"),
    ];

    pub fn from_body(body: &Map<String, Value>) -> Result<Self, ApiError> {
        parse_body(body, Self::FIELDS)
    }
}

/// Body of `PATCH /beer/{id}`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BeerPatch {
    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub name: Option<String>,

    #[validate(custom(function = "validate_object_id"))]
    pub brewery_id: Option<String>,

    #[serde(default, deserialize_with = "alcohol_level")]
    #[validate(range(max = 100, message = "must be numeric, and below 100"))]
    pub alcohol_level: Option<u8>,

    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub picture: Option<String>,
}

impl BeerPatch {
    const FIELDS: Fields = &[
        ("name", "name"),
        ("brewery_id", "breweryId"),
        ("alcohol_level", "alcoholLevel"),
        ("picture", "picture"),
    ];

    pub fn from_body(body: &Map<String, Value>) -> Result<Self, ApiError> {
        parse_body(body, Self::FIELDS)
    }

    pub fn apply(self, beer: &mut Beer) {
        if let Some(name) = self.name {
            beer.name = name;
        }
        if let Some(brewery_id) = self.brewery_id {
            beer.brewery_id = brewery_id;
        }
        if let Some(alcohol_level) = self.alcohol_level {
            beer.alcohol_level = alcohol_level;
        }
        if let Some(picture) = self.picture {
            beer.picture = picture;
        }
    }
}

/// Body of `POST /brewery`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
pub struct NewBrewery {
    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub name: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub owner: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 255, message = "must not have more than 255 characters")
    )]
    pub location: String,
}

impl NewBrewery {
    const FIELDS: Fields = &[("name", "name"), ("owner", "owner"), ("location", "location")];

    pub fn from_body(body: &Map<String, Value>) -> Result<Self, ApiError> {
        parse_body(body, Self::FIELDS)
    }
}

/// Body of `POST /beer/{id}/comments`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
pub struct NewComment {
    #[serde(default, deserialize_with = "null_as_empty")]
    #[validate(
        custom(function = "validate_not_blank"),
        length(max = 2000, message = "must not have more than 2000 characters")
    )]
    pub body: String,
}

impl NewComment {
    const FIELDS: Fields = &[("body", "body")];

    pub fn from_body(body: &Map<String, Value>) -> Result<Self, ApiError> {
        parse_body(body, Self::FIELDS)
    }
}
