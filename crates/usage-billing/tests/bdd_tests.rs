mod bdd;
