//! Integration tests for the shroud relay live in `tests/`.
